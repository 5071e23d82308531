//! Runs every grouping in order: stream scenes, build the collection, write
//! it next to the other layers and publish it. The first failure stops the
//! whole run, nothing is retried.

use crate::aggregate::{AggregateError, FeatureAggregator};
use crate::config::Grouping;
use crate::mapbox_upload::{TileUploader, UploadError, UploadEvent, UploadRequest};
use crate::scene_source::{SceneFilter, SceneSource, SourceError};
use chrono::NaiveDate;
use geojson::FeatureCollection;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Connecting,
    Streaming,
    Finalizing,
    Uploading,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Connecting => "connecting",
            PipelineState::Streaming => "streaming",
            PipelineState::Finalizing => "finalizing",
            PipelineState::Uploading => "uploading",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum GroupingFailure {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("could not write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not serialize feature collection: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

#[derive(Error, Debug)]
#[error("grouping {tileset_id} failed while {failed_in}: {failure}")]
pub struct PipelineError {
    pub tileset_id: String,
    pub failed_in: PipelineState,
    #[source]
    pub failure: GroupingFailure,
}

struct GroupingTask<'a> {
    tileset_id: &'a str,
    state: PipelineState,
}

impl<'a> GroupingTask<'a> {
    fn new(tileset_id: &'a str) -> Self {
        debug!("{}: {}", tileset_id, PipelineState::Connecting);
        Self {
            tileset_id,
            state: PipelineState::Connecting,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug!("{}: {} -> {}", self.tileset_id, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, failure: GroupingFailure) -> PipelineError {
        let failed_in = self.state;
        self.advance(PipelineState::Failed);

        PipelineError {
            tileset_id: self.tileset_id.to_string(),
            failed_in,
            failure,
        }
    }
}

pub struct Pipeline<S, U> {
    source: S,
    uploader: U,
    output_dir: PathBuf,
    access_token: String,
    upload_enabled: bool,
    today: NaiveDate,
}

impl<S, U> Pipeline<S, U>
where
    S: SceneSource,
    U: TileUploader,
{
    pub fn new(source: S, uploader: U, output_dir: PathBuf, access_token: String) -> Self {
        Self {
            source,
            uploader,
            output_dir,
            access_token,
            upload_enabled: true,
            today: chrono::Utc::now().date_naive(),
        }
    }

    /// Only write the GeoJSON files.
    pub fn skip_upload(mut self) -> Self {
        self.upload_enabled = false;
        self
    }

    /// Scenes must be acquired before this date to be included.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// Runs the groupings one after another, returning the written files.
    pub async fn run(&self, groupings: &[Grouping]) -> Result<Vec<PathBuf>, PipelineError> {
        let mut written = Vec::with_capacity(groupings.len());

        for grouping in groupings {
            info!(
                "Running for grouping {} and uploading to {}",
                grouping.pattern, grouping.tileset_id
            );

            let mut task = GroupingTask::new(&grouping.tileset_id);

            match self.run_grouping(grouping, &mut task).await {
                Ok(path) => {
                    task.advance(PipelineState::Done);
                    written.push(path);
                }
                Err(failure) => {
                    let err = task.fail(failure);
                    error!("{}", err);
                    return Err(err);
                }
            }
        }

        info!("All vectorization processes have finished.");
        Ok(written)
    }

    async fn run_grouping(
        &self,
        grouping: &Grouping,
        task: &mut GroupingTask<'_>,
    ) -> Result<PathBuf, GroupingFailure> {
        let filter = SceneFilter::new(grouping.pattern.clone(), self.today)?;
        let records = self.source.scenes(&filter);

        task.advance(PipelineState::Streaming);

        let collection = FeatureAggregator::new(&grouping.pattern)
            .with_progress(|count| info!("Processed {} records.", count))
            .consume(records)
            .await?;

        task.advance(PipelineState::Finalizing);

        let path = self.output_dir.join(grouping.file_name());
        info!(
            "Saving {} features to disk at {}",
            collection.features.len(),
            path.display()
        );
        write_collection(&path, &collection)?;

        if !self.upload_enabled {
            return Ok(path);
        }

        task.advance(PipelineState::Uploading);

        let request = UploadRequest {
            file_path: path.clone(),
            account: grouping.account.clone(),
            access_token: self.access_token.clone(),
            tileset_id: grouping.tileset_id.clone(),
        };
        let tileset = request.full_tileset_id();

        info!("Started uploading to {}", tileset);

        let mut events = self.uploader.upload(request);

        while let Some(event) = events.recv().await {
            match event {
                UploadEvent::Progress { percentage } => {
                    debug!("Upload progress for {}: {}", grouping.tileset_id, percentage)
                }
                UploadEvent::Error(err) => return Err(err.into()),
                UploadEvent::Finished => {
                    info!("Finished uploading to {}", tileset);
                    return Ok(path);
                }
            }
        }

        Err(UploadError::Interrupted.into())
    }
}

fn write_collection(path: &Path, collection: &FeatureCollection) -> Result<(), GroupingFailure> {
    let write_err = |source: io::Error| GroupingFailure::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }

    let file = File::create(path).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, collection)?;
    writer.flush().map_err(write_err)?;

    Ok(())
}
