//! Publishing footprint layers through the Mapbox Tiling Service.
//!
//! An upload is a small job: replace the tileset source with the new
//! features, make sure the tileset recipe points at that source, publish, and
//! poll the publish job. The caller only sees a stream of [`UploadEvent`]s.

use geojson::FeatureCollection;
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub const MAPBOX_API_BASE: &str = "https://api.mapbox.com";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const LAYER_MIN_ZOOM: u8 = 0;
const LAYER_MAX_ZOOM: u8 = 8;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("request to the tiling service failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("tiling service answered {status} for {step}: {body}")]
    Status {
        step: &'static str,
        status: u16,
        body: String,
    },
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid GeoJSON or response body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("publish job {job_id} failed: {errors}")]
    JobFailed { job_id: String, errors: String },
    #[error("publish job {job_id} did not finish within {waited:?}")]
    JobTimedOut { job_id: String, waited: Duration },
    #[error("upload ended without finishing")]
    Interrupted,
}

/// What the pipeline hands over for one grouping.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub file_path: PathBuf,
    pub account: String,
    pub access_token: String,
    /// Tileset name without the account prefix.
    pub tileset_id: String,
}

impl UploadRequest {
    /// `account.tileset`, the id the tileset is addressed by.
    pub fn full_tileset_id(&self) -> String {
        format!("{}.{}", self.account, self.tileset_id)
    }
}

#[derive(Debug)]
pub enum UploadEvent {
    Progress { percentage: f64 },
    Error(UploadError),
    Finished,
}

pub trait TileUploader {
    /// Starts an upload. The receiver yields progress events and ends with
    /// exactly one `Error` or `Finished`.
    fn upload(&self, request: UploadRequest) -> mpsc::UnboundedReceiver<UploadEvent>;
}

#[derive(Clone)]
pub struct MapboxUploader {
    client: reqwest::Client,
    api_base: String,
    poll_interval: Duration,
    job_timeout: Duration,
}

impl Default for MapboxUploader {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl MapboxUploader {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_base: MAPBOX_API_BASE.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How long a publish job may stay queued or processing before giving up.
    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    async fn run(
        &self,
        request: &UploadRequest,
        events: &mpsc::UnboundedSender<UploadEvent>,
    ) -> Result<(), UploadError> {
        let progress = |percentage: f64| {
            let _ = events.send(UploadEvent::Progress { percentage });
        };

        progress(0.0);

        let contents = tokio::fs::read_to_string(&request.file_path)
            .await
            .map_err(|source| UploadError::Io {
                path: request.file_path.clone(),
                source,
            })?;
        let line_delimited = line_delimited_geojson(&contents)?;

        self.replace_source(request, line_delimited).await?;
        progress(40.0);

        self.create_or_update_tileset(request).await?;
        progress(60.0);

        let job_id = self.publish(request).await?;
        progress(70.0);

        let finished =
            tokio::time::timeout(self.job_timeout, self.wait_for_job(request, &job_id)).await;

        match finished {
            Ok(finished) => finished?,
            Err(_) => {
                return Err(UploadError::JobTimedOut {
                    job_id,
                    waited: self.job_timeout,
                });
            }
        }
        progress(100.0);

        Ok(())
    }

    async fn replace_source(
        &self,
        request: &UploadRequest,
        body: String,
    ) -> Result<(), UploadError> {
        let url = format!(
            "{}/tilesets/v1/sources/{}/{}",
            self.api_base, request.account, request.tileset_id
        );

        let part = reqwest::multipart::Part::bytes(body.into_bytes())
            .file_name(format!("{}.geojson.ld", request.tileset_id))
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        debug!("Replacing tileset source {}", request.tileset_id);

        let response = self
            .client
            .put(url)
            .query(&[("access_token", request.access_token.as_str())])
            .multipart(form)
            .send()
            .await?;

        ensure_success("source upload", response).await?;
        Ok(())
    }

    async fn create_or_update_tileset(&self, request: &UploadRequest) -> Result<(), UploadError> {
        let tileset = request.full_tileset_id();
        let recipe = recipe_for(request);

        let response = self
            .client
            .post(format!("{}/tilesets/v1/{}", self.api_base, tileset))
            .query(&[("access_token", request.access_token.as_str())])
            .json(&json!({ "recipe": recipe, "name": request.tileset_id }))
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::BAD_REQUEST {
            ensure_success("tileset creation", response).await?;
            return Ok(());
        }

        // creation answers 400 when the tileset already exists
        let body = response.text().await?;
        if !body.contains("already exists") {
            return Err(UploadError::Status {
                step: "tileset creation",
                status: 400,
                body,
            });
        }

        debug!("Tileset {} exists, updating its recipe", tileset);

        let response = self
            .client
            .patch(format!("{}/tilesets/v1/{}/recipe", self.api_base, tileset))
            .query(&[("access_token", request.access_token.as_str())])
            .json(&recipe)
            .send()
            .await?;

        ensure_success("recipe update", response).await?;
        Ok(())
    }

    async fn publish(&self, request: &UploadRequest) -> Result<String, UploadError> {
        let response = self
            .client
            .post(format!(
                "{}/tilesets/v1/{}/publish",
                self.api_base,
                request.full_tileset_id()
            ))
            .query(&[("access_token", request.access_token.as_str())])
            .send()
            .await?;

        let response = ensure_success("publish", response).await?;
        let published: PublishResponse = serde_json::from_str(&response.text().await?)?;

        Ok(published.job_id)
    }

    async fn wait_for_job(&self, request: &UploadRequest, job_id: &str) -> Result<(), UploadError> {
        let url = format!(
            "{}/tilesets/v1/{}/jobs/{}",
            self.api_base,
            request.full_tileset_id(),
            job_id
        );

        loop {
            tokio::time::sleep(self.poll_interval).await;

            let response = self
                .client
                .get(&url)
                .query(&[("access_token", request.access_token.as_str())])
                .send()
                .await?;

            let response = ensure_success("job status", response).await?;
            let job: JobStatus = serde_json::from_str(&response.text().await?)?;

            match job.stage.as_str() {
                "success" => return Ok(()),
                "failed" => {
                    return Err(UploadError::JobFailed {
                        job_id: job_id.to_string(),
                        errors: serde_json::to_string(&job.errors)?,
                    });
                }
                stage => debug!("Publish job {} is {}", job_id, stage),
            }
        }
    }
}

impl TileUploader for MapboxUploader {
    fn upload(&self, request: UploadRequest) -> mpsc::UnboundedReceiver<UploadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let uploader = self.clone();

        tokio::spawn(async move {
            let outcome = uploader.run(&request, &tx).await;
            let _ = tx.send(match outcome {
                Ok(()) => UploadEvent::Finished,
                Err(err) => UploadEvent::Error(err),
            });
        });

        rx
    }
}

#[derive(Deserialize)]
struct PublishResponse {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Deserialize)]
struct JobStatus {
    stage: String,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

async fn ensure_success(
    step: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, UploadError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();

    Err(UploadError::Status {
        step,
        status: status.as_u16(),
        body,
    })
}

/// Tileset sources take one feature per line instead of a FeatureCollection.
fn line_delimited_geojson(contents: &str) -> Result<String, serde_json::Error> {
    let collection: FeatureCollection = serde_json::from_str(contents)?;

    let mut body = String::new();
    for feature in &collection.features {
        body.push_str(&serde_json::to_string(feature)?);
        body.push('\n');
    }

    Ok(body)
}

fn recipe_for(request: &UploadRequest) -> serde_json::Value {
    let mut layers = serde_json::Map::new();
    layers.insert(
        request.tileset_id.clone(),
        json!({
            "source": format!("mapbox://tileset-source/{}/{}", request.account, request.tileset_id),
            "minzoom": LAYER_MIN_ZOOM,
            "maxzoom": LAYER_MAX_ZOOM
        }),
    );

    json!({
        "version": 1,
        "layers": layers
    })
}
