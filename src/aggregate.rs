use crate::antimeridian::normalize_polygon;
use crate::models::{SceneRecord, ScenePattern};
use crate::scene_properties::{AnnotateError, PR_KEY, annotate, pr_key};
use crate::scene_source::SourceError;
use ahash::AHashMap;
use futures::{Stream, StreamExt};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, JsonValue, Value};
use std::collections::hash_map::Entry;
use thiserror::Error;
use tracing::debug;

/// The progress callback fires each time this many path/row groups have been created.
pub const PROGRESS_EVERY: usize = 1000;

pub type ProgressCallback = Box<dyn FnMut(usize) + Send>;

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("scene source failed: {0}")]
    Source(#[from] SourceError),
    #[error("could not annotate scene: {0}")]
    Annotate(#[from] AnnotateError),
}

/// Merges scene records into one polygon feature per path/row.
///
/// The aggregator owns its features for the whole run. Output order is the
/// order in which each path/row was first seen.
pub struct FeatureAggregator {
    annotate_scenes: bool,
    features: Vec<Feature>,
    //pr key -> index into features
    positions: AHashMap<String, usize>,
    on_progress: Option<ProgressCallback>,
}

impl FeatureAggregator {
    pub fn new(pattern: &ScenePattern) -> Self {
        Self {
            annotate_scenes: !pattern.is_all(),
            features: Vec::new(),
            positions: AHashMap::new(),
            on_progress: None,
        }
    }

    pub fn with_progress<F>(mut self, on_progress: F) -> Self
    where
        F: FnMut(usize) + Send + 'static,
    {
        self.on_progress = Some(Box::new(on_progress));
        self
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Adds one scene. The first record of a path/row decides the geometry.
    pub fn push(&mut self, record: &SceneRecord) -> Result<(), AnnotateError> {
        let pr = pr_key(record.path, record.row);

        let (position, created) = match self.positions.entry(pr) {
            Entry::Occupied(entry) => {
                debug!("We found a matching feature for {}", entry.key());
                (*entry.get(), false)
            }
            Entry::Vacant(entry) => {
                debug!("Adding a new feature for {}", entry.key());
                let position = self.features.len();
                self.features.push(new_feature(entry.key(), record));
                entry.insert(position);
                (position, true)
            }
        };

        if self.annotate_scenes {
            annotate(&mut self.features[position], record)?;
        }

        if created && self.features.len() % PROGRESS_EVERY == 0 {
            if let Some(on_progress) = self.on_progress.as_mut() {
                on_progress(self.features.len());
            }
        }

        Ok(())
    }

    /// Drains a scene stream until it ends, then hands back the collection.
    pub async fn consume<S>(mut self, records: S) -> Result<FeatureCollection, AggregateError>
    where
        S: Stream<Item = Result<SceneRecord, SourceError>>,
    {
        futures::pin_mut!(records);

        while let Some(record) = records.next().await {
            let record = record?;
            self.push(&record)?;
        }

        debug!("Scene stream ended");

        Ok(self.finish())
    }

    pub fn finish(self) -> FeatureCollection {
        FeatureCollection {
            bbox: None,
            features: self.features,
            foreign_members: None,
        }
    }
}

fn new_feature(pr: &str, record: &SceneRecord) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert(PR_KEY.to_string(), JsonValue::from(pr));

    let polygon = normalize_polygon(record.bounding_box.clone());

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::from(&polygon))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

/// Aggregates an in-memory batch of already filtered scenes.
pub fn aggregate<'a, I>(
    records: I,
    pattern: &ScenePattern,
) -> Result<FeatureCollection, AnnotateError>
where
    I: IntoIterator<Item = &'a SceneRecord>,
{
    let mut aggregator = FeatureAggregator::new(pattern);

    for record in records {
        aggregator.push(record)?;
    }

    Ok(aggregator.finish())
}
