//! Compact per-scene properties on path/row features.
//!
//! Every feature carries `pr` plus one `(s{i}, c{i}, d{i})` triple per merged
//! scene. Keys are kept to one letter and values to a few characters because
//! the properties ship inside every vector tile of the layer. The web client
//! decodes these exact keys and offsets, so they cannot change without
//! breaking already published tilesets.

use crate::models::SceneRecord;
use geojson::{Feature, JsonObject, JsonValue};
use std::fmt::Display;
use thiserror::Error;
use tracing::debug;

pub const PR_KEY: &str = "pr";

/// Scene ids are fixed width, e.g. `LC81080342015001LGN00`.
pub const SCENE_ID_LEN: usize = 21;

// sensor, ground station suffix, archive version
const SCENE_CODE_OFFSETS: [usize; 3] = [1, 18, 20];
const DAY_OF_YEAR_RANGE: std::ops::Range<usize> = 13..16;

const PROPERTIES_PER_SCENE: usize = 3;

#[derive(Error, Debug, PartialEq)]
pub enum AnnotateError {
    #[error("feature has no `pr` property")]
    MissingPrKey,
    #[error("feature has {count} properties, expected `pr` plus whole scene triples")]
    PropertyCount { count: usize },
    #[error("scene record has a cloud cover but no scene id")]
    MissingSceneId,
    #[error("scene id '{scene_id}' is {len} characters long, expected 21")]
    SceneIdTooShort { scene_id: String, len: usize },
    #[error("scene id '{scene_id}' has a non numeric day of year '{day}'")]
    DayOfYear { scene_id: String, day: String },
}

/// Left pads the display form of `value` with zeros up to `width` characters.
pub fn zero_pad<T: Display>(value: T, width: usize) -> String {
    format!("{:0>width$}", value.to_string(), width = width)
}

/// The `ppp,rrr` key scenes are grouped under.
pub fn pr_key(path: i32, row: i32) -> String {
    format!("{},{}", zero_pad(path, 3), zero_pad(row, 3))
}

/// Appends the next scene triple for `record` to the feature's properties.
///
/// A record without any scene fields leaves the feature as it is.
pub fn annotate<'f>(
    feature: &'f mut Feature,
    record: &SceneRecord,
) -> Result<&'f mut Feature, AnnotateError> {
    if record.has_no_scene_fields() {
        return Ok(feature);
    }

    let properties = feature
        .properties
        .as_mut()
        .ok_or(AnnotateError::MissingPrKey)?;

    let idx = next_scene_index(properties)?;

    let scene_id = record
        .scene_id
        .as_deref()
        .ok_or(AnnotateError::MissingSceneId)?;

    debug!("Adding properties for {}", scene_id);

    let encoded = encode_scene_id(scene_id)?;

    properties.insert(format!("s{}", idx), JsonValue::from(encoded.code));
    properties.insert(
        format!("c{}", idx),
        record
            .cloud_cover_full
            .map(cloud_cover_value)
            .unwrap_or(JsonValue::Null),
    );
    properties.insert(format!("d{}", idx), JsonValue::from(encoded.day_of_year));

    Ok(feature)
}

fn next_scene_index(properties: &JsonObject) -> Result<usize, AnnotateError> {
    if !properties.contains_key(PR_KEY) {
        return Err(AnnotateError::MissingPrKey);
    }

    let scene_keys = properties.len() - 1;

    if scene_keys % PROPERTIES_PER_SCENE != 0 {
        return Err(AnnotateError::PropertyCount {
            count: properties.len(),
        });
    }

    Ok(scene_keys / PROPERTIES_PER_SCENE)
}

struct EncodedSceneId {
    code: String,
    day_of_year: u32,
}

fn encode_scene_id(scene_id: &str) -> Result<EncodedSceneId, AnnotateError> {
    let chars: Vec<char> = scene_id.chars().collect();

    if chars.len() < SCENE_ID_LEN {
        return Err(AnnotateError::SceneIdTooShort {
            scene_id: scene_id.to_string(),
            len: chars.len(),
        });
    }

    let code: String = SCENE_CODE_OFFSETS.iter().map(|&i| chars[i]).collect();

    let day: String = chars[DAY_OF_YEAR_RANGE].iter().collect();

    let day_of_year = if day.chars().all(|c| c.is_ascii_digit()) {
        day.parse::<u32>().ok()
    } else {
        None
    };

    match day_of_year {
        Some(day_of_year) => Ok(EncodedSceneId { code, day_of_year }),
        None => Err(AnnotateError::DayOfYear {
            scene_id: scene_id.to_string(),
            day,
        }),
    }
}

// whole percentages are written as integers, the way the metadata API reports them
fn cloud_cover_value(cover: f64) -> JsonValue {
    if cover.fract() == 0.0 && cover.abs() < i64::MAX as f64 {
        JsonValue::from(cover as i64)
    } else {
        serde_json::Number::from_f64(cover)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}
