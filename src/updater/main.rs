// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//cargo run --bin updater --release -- --params params.json

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use anyhow::Context;
use clap::Parser;
use landsat_tiles::config::{ConfigOverrides, UpdaterConfig, UpdaterParams};
use landsat_tiles::mapbox_upload::{MapboxUploader, TileUploader};
use landsat_tiles::pipeline::Pipeline;
use landsat_tiles::postgres_tools::make_pool;
use landsat_tiles::scene_source::{JsonSceneSource, PostgresSceneSource, SceneSource};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker params JSON: groupings, dbURL, mapboxToken, logLevel
    #[arg(long, env = "UPDATER_PARAMS")]
    params: Option<PathBuf>,

    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "MAPBOX_TOKEN")]
    mapbox_token: Option<String>,

    /// error, warn, info, verbose/debug or trace
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Where the <tileSetId>.geojson files are written
    #[arg(long, env = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    #[arg(long, env = "SCENES_TABLE")]
    scenes_table: Option<String>,

    /// Read scenes from a JSON dump instead of Postgres
    #[arg(long, env = "SCENES_FILE")]
    scenes_file: Option<PathBuf>,

    /// Write the GeoJSON files without publishing them
    #[arg(long)]
    skip_upload: bool,

    /// Seconds between publish job status checks
    #[arg(long, default_value_t = 5)]
    poll_secs: u64,
}

fn load_config(args: &Args) -> anyhow::Result<UpdaterConfig> {
    let params = match &args.params {
        Some(path) => UpdaterParams::from_path(path)?,
        None => UpdaterParams::default(),
    };

    let overrides = ConfigOverrides {
        database_url: args.database_url.clone(),
        mapbox_token: args.mapbox_token.clone(),
        log_level: args.log_level.clone(),
        output_dir: args.output_dir.clone(),
        scenes_table: args.scenes_table.clone(),
        scenes_file: args.scenes_file.clone(),
        skip_upload: args.skip_upload,
    };

    Ok(UpdaterConfig::resolve(params, overrides)?)
}

async fn run_groupings<S, U>(source: S, uploader: U, config: &UpdaterConfig) -> anyhow::Result<()>
where
    S: SceneSource,
    U: TileUploader,
{
    let mut pipeline = Pipeline::new(
        source,
        uploader,
        config.output_dir.clone(),
        config.mapbox_token.clone().unwrap_or_default(),
    );

    if config.skip_upload {
        pipeline = pipeline.skip_upload();
    }

    let written = pipeline.run(&config.groupings).await?;
    info!("Wrote {} layers", written.len());

    Ok(())
}

async fn run(config: UpdaterConfig, poll_secs: u64) -> anyhow::Result<()> {
    let uploader = MapboxUploader::default().with_poll_interval(Duration::from_secs(poll_secs));

    match &config.scenes_file {
        Some(path) => {
            info!("Reading scenes from {}", path.display());
            run_groupings(JsonSceneSource::new(path), uploader, &config).await
        }
        None => {
            let pool = make_pool(&config.database_url)
                .await
                .context("Could not reach the scene database")?;

            info!("Connected to the database.");

            let source = PostgresSceneSource::new(pool, &config.scenes_table)?;

            run_groupings(source, uploader, &config).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{:#}", err);
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    match run(config, args.poll_secs).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Exiting with an error");
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
