//! Where scene records come from.
//!
//! Every source applies the same predicate: daytime scenes only and, unless
//! the grouping is `all`, acquired before today with a date matching the
//! grouping pattern. Postgres evaluates it in SQL, the JSON file source in
//! process.

use crate::models::{DayOrNight, SceneRecord, ScenePattern};
use chrono::NaiveDate;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use geo_types::Polygon;
use regex::Regex;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_SCENES_TABLE: &str = "landsat.scenes";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("could not connect to the scene database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("scene query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("could not decode scene row: {0}")]
    Decode(String),
    #[error("invalid date pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("'{0}' is not a table name, expected `table` or `schema.table`")]
    TableName(String),
    #[error("I/O error reading scenes from '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid scene document in '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The record predicate for one grouping.
#[derive(Clone, Debug)]
pub struct SceneFilter {
    pub pattern: ScenePattern,
    /// ISO date, scenes must be acquired strictly before it
    pub before: String,
    date_regex: Option<Regex>,
}

impl SceneFilter {
    pub fn new(pattern: ScenePattern, today: NaiveDate) -> Result<Self, SourceError> {
        let date_regex = match &pattern {
            ScenePattern::All => None,
            ScenePattern::Matching(fragment) => Some(Regex::new(fragment)?),
        };

        Ok(Self {
            pattern,
            before: today.format("%Y-%m-%d").to_string(),
            date_regex,
        })
    }

    pub fn matches(&self, record: &SceneRecord) -> bool {
        if record.day_or_night != DayOrNight::Day {
            return false;
        }

        match &self.date_regex {
            None => true,
            Some(date_regex) => {
                record.acquisition_date.as_str() < self.before.as_str()
                    && date_regex.is_match(&record.acquisition_date)
            }
        }
    }
}

pub trait SceneSource {
    /// Streams every scene passing `filter`, ending when the source is exhausted.
    fn scenes(&self, filter: &SceneFilter) -> BoxStream<'_, Result<SceneRecord, SourceError>>;
}

pub struct PostgresSceneSource {
    pool: PgPool,
    query: String,
}

impl PostgresSceneSource {
    /// Fails when `table` is not a plain `table` or `schema.table` name, since
    /// it ends up inside the query text.
    pub fn new(pool: PgPool, table: &str) -> Result<Self, SourceError> {
        Ok(Self {
            pool,
            query: scenes_query(table)?,
        })
    }
}

fn is_table_name(table: &str) -> bool {
    let parts: Vec<&str> = table.split('.').collect();

    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

fn scenes_query(table: &str) -> Result<String, SourceError> {
    if !is_table_name(table) {
        return Err(SourceError::TableName(table.to_string()));
    }

    // path and row may be stored as any integer width
    Ok(format!(
        "SELECT
    path::int4 AS path,
    \"row\"::int4 AS \"row\",
    acquisition_date::text AS acquisition_date,
    day_or_night,
    ST_AsGeoJSON(bounding_box) AS bounding_box,
    scene_id,
    cloud_cover_full::float8 AS cloud_cover_full
FROM {table}
WHERE day_or_night = 'DAY'
    AND ($1::text IS NULL OR (acquisition_date::text < $2 AND acquisition_date::text ~ $1))",
        table = table
    ))
}

impl SceneSource for PostgresSceneSource {
    fn scenes(&self, filter: &SceneFilter) -> BoxStream<'_, Result<SceneRecord, SourceError>> {
        let pattern = match &filter.pattern {
            ScenePattern::All => None,
            ScenePattern::Matching(fragment) => Some(fragment.clone()),
        };

        debug!("Querying scenes with pattern {}", filter.pattern);

        sqlx::query(self.query.as_str())
            .bind(pattern)
            .bind(filter.before.clone())
            .fetch(&self.pool)
            .map_err(SourceError::Query)
            .and_then(|row| async move { scene_from_row(&row) })
            .boxed()
    }
}

fn scene_from_row(row: &PgRow) -> Result<SceneRecord, SourceError> {
    let day_or_night: String = row.try_get("day_or_night").map_err(SourceError::Query)?;
    let bounding_box: String = row.try_get("bounding_box").map_err(SourceError::Query)?;

    Ok(SceneRecord {
        path: row.try_get("path").map_err(SourceError::Query)?,
        row: row.try_get("row").map_err(SourceError::Query)?,
        acquisition_date: row
            .try_get("acquisition_date")
            .map_err(SourceError::Query)?,
        day_or_night: day_or_night
            .parse::<DayOrNight>()
            .map_err(SourceError::Decode)?,
        bounding_box: polygon_from_geojson(&bounding_box)?,
        scene_id: row.try_get("scene_id").map_err(SourceError::Query)?,
        cloud_cover_full: row
            .try_get("cloud_cover_full")
            .map_err(SourceError::Query)?,
    })
}

fn polygon_from_geojson(text: &str) -> Result<Polygon<f64>, SourceError> {
    let geometry = text
        .parse::<geojson::Geometry>()
        .map_err(|e| SourceError::Decode(format!("bounding box: {}", e)))?;

    Polygon::<f64>::try_from(geometry)
        .map_err(|e| SourceError::Decode(format!("bounding box is not a polygon: {}", e)))
}

/// Scenes from a JSON dump of the metadata collection, either one array or
/// one document per line.
pub struct JsonSceneSource {
    path: PathBuf,
}

impl JsonSceneSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SceneSource for JsonSceneSource {
    fn scenes(&self, filter: &SceneFilter) -> BoxStream<'_, Result<SceneRecord, SourceError>> {
        let filter = filter.clone();

        stream::once(load_scene_file(&self.path))
            .map(move |loaded| match loaded {
                Ok(records) => {
                    let filter = filter.clone();
                    stream::iter(
                        records
                            .into_iter()
                            .filter(move |record| filter.matches(record))
                            .map(Ok),
                    )
                    .left_stream()
                }
                Err(err) => stream::iter(vec![Err(err)]).right_stream(),
            })
            .flatten()
            .boxed()
    }
}

async fn load_scene_file(path: &Path) -> Result<Vec<SceneRecord>, SourceError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let json_err = |source: serde_json::Error| SourceError::Json {
        path: path.to_path_buf(),
        source,
    };

    if contents.trim_start().starts_with('[') {
        serde_json::from_str(&contents).map_err(json_err)
    } else {
        serde_json::Deserializer::from_str(&contents)
            .into_iter::<SceneRecord>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(json_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2016, 3, 1).unwrap()
    }

    fn doc(path: i32, date: &str, day_or_night: &str) -> serde_json::Value {
        json!({
            "path": path,
            "row": 34,
            "acquisitionDate": date,
            "dayOrNight": day_or_night,
            "sceneID": format!("LC8{:03}0342015001LGN00", path),
            "cloudCoverFull": 10,
            "boundingBox": {
                "type": "Polygon",
                "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]]]
            }
        })
    }

    fn record(date: &str, day_or_night: &str) -> SceneRecord {
        serde_json::from_value(doc(1, date, day_or_night)).unwrap()
    }

    fn temp_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("scenes-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn all_pattern_only_checks_daytime() {
        let filter = SceneFilter::new(ScenePattern::All, today()).unwrap();

        assert!(filter.matches(&record("2013-04-11", "DAY")));
        assert!(filter.matches(&record("2030-01-01", "DAY")));
        assert!(!filter.matches(&record("2013-04-11", "NIGHT")));
    }

    #[test]
    fn pattern_matches_acquisition_date() {
        let filter = SceneFilter::new(ScenePattern::from("2015"), today()).unwrap();

        assert!(filter.matches(&record("2015-06-01", "DAY")));
        assert!(!filter.matches(&record("2014-06-01", "DAY")));
        assert!(!filter.matches(&record("2015-06-01", "NIGHT")));
    }

    #[test]
    fn pattern_excludes_today_and_later() {
        let filter = SceneFilter::new(ScenePattern::from("2016"), today()).unwrap();

        assert!(filter.matches(&record("2016-02-29", "DAY")));
        assert!(!filter.matches(&record("2016-03-01", "DAY")));
        assert!(!filter.matches(&record("2016-07-01", "DAY")));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let result = SceneFilter::new(ScenePattern::from("2015-(0"), today());

        assert!(matches!(result, Err(SourceError::Pattern(_))));
    }

    #[test]
    fn query_filters_in_sql() {
        let query = scenes_query("public.landsats").unwrap();

        assert!(query.contains("FROM public.landsats"));
        assert!(query.contains("day_or_night = 'DAY'"));
        assert!(query.contains("ST_AsGeoJSON(bounding_box)"));
    }

    #[test]
    fn query_reads_path_and_row_as_int4() {
        let query = scenes_query(DEFAULT_SCENES_TABLE).unwrap();

        assert!(query.contains("path::int4 AS path"));
        assert!(query.contains("\"row\"::int4 AS \"row\""));
    }

    #[test]
    fn table_names_are_checked_before_querying() {
        assert!(scenes_query("scenes").is_ok());
        assert!(scenes_query("_landsat.scenes_2015").is_ok());

        for bad in [
            "",
            "landsat.",
            "a.b.c",
            "2015scenes",
            "scenes; DROP TABLE scenes",
            "scenes WHERE true --",
            "\"scenes\"",
        ] {
            assert!(
                matches!(scenes_query(bad), Err(SourceError::TableName(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn decodes_postgis_geojson() {
        let polygon = polygon_from_geojson(
            r#"{"type":"Polygon","coordinates":[[[179.5,60],[-179.5,60],[-179.5,61],[179.5,60]]]}"#,
        )
        .unwrap();
        assert_eq!(polygon.exterior().0.len(), 4);

        assert!(matches!(
            polygon_from_geojson(r#"{"type":"Point","coordinates":[1,2]}"#),
            Err(SourceError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn json_array_source_applies_filter() {
        let contents = json!([
            doc(1, "2015-01-01", "DAY"),
            doc(2, "2015-01-02", "NIGHT"),
            doc(3, "2014-01-03", "DAY"),
            doc(4, "2015-01-04", "DAY"),
        ])
        .to_string();
        let path = temp_file(&contents);

        let source = JsonSceneSource::new(&path);
        let filter = SceneFilter::new(ScenePattern::from("2015"), today()).unwrap();
        let records: Vec<SceneRecord> = source.scenes(&filter).try_collect().await.unwrap();

        let paths: Vec<i32> = records.iter().map(|r| r.path).collect();
        assert_eq!(paths, vec![1, 4]);

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn json_lines_source_is_supported() {
        let contents = format!(
            "{}\n{}\n",
            doc(7, "2015-01-01", "DAY"),
            doc(8, "2015-01-02", "DAY")
        );
        let path = temp_file(&contents);

        let source = JsonSceneSource::new(&path);
        let filter = SceneFilter::new(ScenePattern::All, today()).unwrap();
        let records: Vec<SceneRecord> = source.scenes(&filter).try_collect().await.unwrap();

        assert_eq!(records.len(), 2);

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_a_source_error() {
        let source = JsonSceneSource::new("/nonexistent/scenes.json");
        let filter = SceneFilter::new(ScenePattern::All, today()).unwrap();

        let result: Result<Vec<SceneRecord>, SourceError> =
            source.scenes(&filter).try_collect().await;

        assert!(matches!(result, Err(SourceError::Io { .. })));
    }
}
