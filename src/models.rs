use geo_types::Polygon;
use std::fmt;
use std::str::FromStr;

/// Whether a scene was captured on the daytime or nighttime side of the orbit.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOrNight {
    Day,
    Night,
}

impl DayOrNight {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayOrNight::Day => "DAY",
            DayOrNight::Night => "NIGHT",
        }
    }
}

impl fmt::Display for DayOrNight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DayOrNight {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DAY" => Ok(DayOrNight::Day),
            "NIGHT" => Ok(DayOrNight::Night),
            other => Err(format!("unknown dayOrNight value {}", other)),
        }
    }
}

/// One Landsat scene, as stored in the scenes collection.
///
/// Field names follow the camelCase document shape of the metadata API, so a
/// dump of that collection deserializes as is.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SceneRecord {
    pub path: i32,
    pub row: i32,
    /// ISO `YYYY-MM-DD`
    pub acquisition_date: String,
    pub day_or_night: DayOrNight,
    #[serde(deserialize_with = "geojson::de::deserialize_geometry")]
    pub bounding_box: Polygon<f64>,
    // both scene fields missing is the "nothing to annotate" signal
    #[serde(rename = "sceneID", default)]
    pub scene_id: Option<String>,
    #[serde(default)]
    pub cloud_cover_full: Option<f64>,
}

impl SceneRecord {
    /// True when the record carries none of the per-scene metadata fields.
    pub fn has_no_scene_fields(&self) -> bool {
        self.scene_id.is_none() && self.cloud_cover_full.is_none()
    }
}

/// Date filter of a grouping. `all` disables date filtering and scene annotation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ScenePattern {
    All,
    /// Regex fragment matched against `acquisitionDate`.
    Matching(String),
}

impl ScenePattern {
    pub const ALL: &'static str = "all";

    pub fn is_all(&self) -> bool {
        matches!(self, ScenePattern::All)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ScenePattern::All => Self::ALL,
            ScenePattern::Matching(pattern) => pattern.as_str(),
        }
    }
}

impl From<String> for ScenePattern {
    fn from(pattern: String) -> Self {
        if pattern == Self::ALL {
            ScenePattern::All
        } else {
            ScenePattern::Matching(pattern)
        }
    }
}

impl From<&str> for ScenePattern {
    fn from(pattern: &str) -> Self {
        ScenePattern::from(pattern.to_string())
    }
}

impl fmt::Display for ScenePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_metadata_document() {
        let doc = serde_json::json!({
            "path": 108,
            "row": 34,
            "acquisitionDate": "2015-01-01",
            "dayOrNight": "DAY",
            "sceneID": "LC81080342015001LGN00",
            "cloudCoverFull": 10,
            "boundingBox": {
                "type": "Polygon",
                "coordinates": [[[139.0, 35.0], [141.0, 35.0], [141.0, 37.0], [139.0, 37.0], [139.0, 35.0]]]
            }
        });

        let record: SceneRecord = serde_json::from_value(doc).unwrap();

        assert_eq!(record.path, 108);
        assert_eq!(record.row, 34);
        assert_eq!(record.day_or_night, DayOrNight::Day);
        assert_eq!(record.scene_id.as_deref(), Some("LC81080342015001LGN00"));
        assert_eq!(record.cloud_cover_full, Some(10.0));
        assert_eq!(record.bounding_box.exterior().0.len(), 5);
        assert!(!record.has_no_scene_fields());
    }

    #[test]
    fn scene_fields_are_optional() {
        let doc = serde_json::json!({
            "path": 1,
            "row": 2,
            "acquisitionDate": "2015-01-01",
            "dayOrNight": "NIGHT",
            "boundingBox": {
                "type": "Polygon",
                "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
            }
        });

        let record: SceneRecord = serde_json::from_value(doc).unwrap();

        assert_eq!(record.day_or_night, DayOrNight::Night);
        assert!(record.has_no_scene_fields());
    }

    #[test]
    fn all_is_the_only_special_pattern() {
        assert!(ScenePattern::from("all").is_all());
        assert!(!ScenePattern::from("All").is_all());
        assert_eq!(
            ScenePattern::from("2015"),
            ScenePattern::Matching("2015".to_string())
        );
        assert_eq!(ScenePattern::from("^2014-0[1-6]").as_str(), "^2014-0[1-6]");
    }

    #[test]
    fn day_or_night_parses_case_insensitively() {
        assert_eq!("day".parse::<DayOrNight>(), Ok(DayOrNight::Day));
        assert_eq!("NIGHT".parse::<DayOrNight>(), Ok(DayOrNight::Night));
        assert!("dusk".parse::<DayOrNight>().is_err());
    }
}
