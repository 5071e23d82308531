use crate::models::ScenePattern;
use crate::scene_source::DEFAULT_SCENES_TABLE;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::Level;

pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost/landsat-api";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read params file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid params file '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("a Mapbox access token is required to upload tilesets")]
    MissingToken,
    #[error("unknown log level '{0}'")]
    LogLevel(String),
}

/// One output layer: which scenes go in and which tileset they end up in.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Grouping {
    pub pattern: ScenePattern,
    #[serde(alias = "mapboxAccount")]
    pub account: String,
    #[serde(rename = "tileSetId", alias = "mapboxID")]
    pub tileset_id: String,
}

impl Grouping {
    pub fn file_name(&self) -> String {
        format!("{}.geojson", self.tileset_id)
    }
}

/// The worker params document.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdaterParams {
    #[serde(rename = "dbURL", default)]
    pub db_url: Option<String>,
    #[serde(default)]
    pub groupings: Vec<Grouping>,
    #[serde(default)]
    pub mapbox_token: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
}

impl UpdaterParams {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Values given on the command line or through the environment. They win
/// over the params file.
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub mapbox_token: Option<String>,
    pub log_level: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub scenes_table: Option<String>,
    pub scenes_file: Option<PathBuf>,
    pub skip_upload: bool,
}

#[derive(Clone, Debug)]
pub struct UpdaterConfig {
    pub database_url: String,
    pub scenes_table: String,
    /// Read scenes from this JSON dump instead of the database.
    pub scenes_file: Option<PathBuf>,
    pub groupings: Vec<Grouping>,
    pub mapbox_token: Option<String>,
    pub log_level: Level,
    pub output_dir: PathBuf,
    pub skip_upload: bool,
}

impl UpdaterConfig {
    pub fn resolve(params: UpdaterParams, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let log_level = overrides
            .log_level
            .or(params.log_level)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        let mapbox_token = overrides.mapbox_token.or(params.mapbox_token);

        if mapbox_token.is_none() && !overrides.skip_upload && !params.groupings.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        Ok(Self {
            database_url: overrides
                .database_url
                .or(params.db_url)
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            scenes_table: overrides
                .scenes_table
                .unwrap_or_else(|| DEFAULT_SCENES_TABLE.to_string()),
            scenes_file: overrides.scenes_file,
            groupings: params.groupings,
            mapbox_token,
            log_level: parse_log_level(&log_level)?,
            output_dir: overrides.output_dir.unwrap_or_else(|| PathBuf::from(".")),
            skip_upload: overrides.skip_upload,
        })
    }
}

/// Accepts tracing level names plus the winston names older params files use.
pub fn parse_log_level(level: &str) -> Result<Level, ConfigError> {
    match level.to_ascii_lowercase().as_str() {
        "error" => Ok(Level::ERROR),
        "warn" | "warning" => Ok(Level::WARN),
        "info" => Ok(Level::INFO),
        "verbose" | "debug" => Ok(Level::DEBUG),
        "silly" | "trace" => Ok(Level::TRACE),
        _ => Err(ConfigError::LogLevel(level.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_params(json: &str) -> UpdaterParams {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn reads_original_param_names() {
        let params = parse_params(
            r#"{
                "dbURL": "postgres://db/landsat",
                "mapboxToken": "sk.abc",
                "logLevel": "verbose",
                "groupings": [
                    {"pattern": "all", "mapboxAccount": "devseed", "mapboxID": "landsat-all"},
                    {"pattern": "2015", "account": "devseed", "tileSetId": "landsat-2015"}
                ]
            }"#,
        );

        assert_eq!(params.db_url.as_deref(), Some("postgres://db/landsat"));
        assert_eq!(
            params.groupings,
            vec![
                Grouping {
                    pattern: ScenePattern::All,
                    account: "devseed".to_string(),
                    tileset_id: "landsat-all".to_string(),
                },
                Grouping {
                    pattern: ScenePattern::Matching("2015".to_string()),
                    account: "devseed".to_string(),
                    tileset_id: "landsat-2015".to_string(),
                },
            ]
        );
        assert_eq!(params.groupings[1].file_name(), "landsat-2015.geojson");
    }

    #[test]
    fn overrides_win_over_params() {
        let params = parse_params(
            r#"{"dbURL": "postgres://params", "mapboxToken": "sk.params", "logLevel": "error"}"#,
        );
        let overrides = ConfigOverrides {
            database_url: Some("postgres://cli".to_string()),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        let config = UpdaterConfig::resolve(params, overrides).unwrap();

        assert_eq!(config.database_url, "postgres://cli");
        assert_eq!(config.mapbox_token.as_deref(), Some("sk.params"));
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = UpdaterConfig::resolve(UpdaterParams::default(), ConfigOverrides::default())
            .unwrap();

        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.scenes_table, DEFAULT_SCENES_TABLE);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.output_dir, PathBuf::from("."));
        assert!(config.groupings.is_empty());
    }

    #[test]
    fn uploads_need_a_token() {
        let params = parse_params(r#"{"groupings": [{"pattern": "all", "account": "a", "tileSetId": "b"}]}"#);

        let result = UpdaterConfig::resolve(params, ConfigOverrides::default());
        assert!(matches!(result, Err(ConfigError::MissingToken)));

        let params = parse_params(r#"{"groupings": [{"pattern": "all", "account": "a", "tileSetId": "b"}]}"#);
        let overrides = ConfigOverrides {
            skip_upload: true,
            ..Default::default()
        };
        assert!(UpdaterConfig::resolve(params, overrides).is_ok());
    }

    #[test]
    fn log_levels() {
        assert_eq!(parse_log_level("verbose").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(matches!(
            parse_log_level("loud"),
            Err(ConfigError::LogLevel(_))
        ));
    }

    #[test]
    fn missing_params_file_is_reported() {
        let result = UpdaterParams::from_path(Path::new("/nonexistent/params.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
