// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license
use crate::scene_source::SourceError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// The updater streams one grouping at a time, so a handful of connections is plenty.
pub const MAX_CONNECTIONS: u32 = 4;

pub async fn make_pool(database_url: &str) -> Result<PgPool, SourceError> {
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
        .map_err(SourceError::Connect)
}
