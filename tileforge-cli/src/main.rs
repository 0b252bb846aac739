//! Tileforge CLI.
//!
//! Invocation: `tileforge <profile> key=value ...` where the keys are the
//! run settings (`input=…`, `output=…`, `maxzoom=…`, see `--help`). The
//! binary only parses arguments, sets up logging, and maps pipeline errors
//! to exit codes; everything else lives in the library.

mod error;

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use error::CliError;
use tileforge::config::{Arguments, PipelineConfig};
use tileforge::error::PipelineError;
use tileforge::logging::init_logging;
use tileforge::pipeline::PipelineEngine;
use tileforge::profile::{create_profile, PROFILE_NAMES};

#[derive(Parser)]
#[command(name = "tileforge")]
#[command(version = tileforge::VERSION)]
#[command(about = "Render OpenStreetMap data into an MBTiles vector tile archive")]
#[command(after_help = "\
SETTINGS (key=value):
  input=PATH                  OSM PBF input (required)
  output=PATH                 MBTiles output (required)
  centerline=PATH             lake centerline shapefile
  natural_earth=PATH          Natural Earth sqlite dump
  water_polygons=PATH         water polygons shapefile
  tmpdir=PATH                 scratch directory (default ./data/tmp)
  bounds=W,S,E,N | world      render bounds (default: from input header)
  threads=N                   worker count (default: CPU count)
  minzoom=N maxzoom=N         zoom range, 0..=14 (default 0,14)
  name_languages=en,de,...    languages for name:* attributes
  fetch_wikidata=BOOL         fetch wikidata labels (default false)
  use_wikidata=BOOL           use cached wikidata labels (default true)
  wikidata_cache=PATH         label cache (default data/sources/wikidata_names.json)
  defer_mbtiles_index_creation=BOOL   create the tile index after load
  optimize_db=BOOL            VACUUM/ANALYZE the output on close
  loginterval=DURATION        progress log cadence (default 10s)")]
struct Cli {
    /// Schema profile to render with.
    profile: String,

    /// Run settings as key=value pairs.
    #[arg(trailing_var_arg = true)]
    settings: Vec<String>,

    /// Also write logs to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        error.exit();
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let _guard = init_logging(cli.log_file.as_deref()).map_err(CliError::LoggingInit)?;

    if !PROFILE_NAMES.contains(&cli.profile.as_str()) {
        return Err(CliError::Argument(format!(
            "unknown profile '{}'; known profiles: {}",
            cli.profile,
            PROFILE_NAMES.join(", ")
        )));
    }

    let args = Arguments::parse(cli.settings.into_iter())?;
    let config = PipelineConfig::from_arguments(&args)?;
    info!(
        profile = %cli.profile,
        input = %config.input.display(),
        output = %config.output.display(),
        threads = config.threads,
        "starting tileforge {}",
        tileforge::VERSION
    );

    let profile_name = cli.profile.clone();
    let engine = PipelineEngine::new(config);
    let summary = engine.run(Box::new(move |translations| {
        create_profile(&profile_name, translations).ok_or_else(|| {
            PipelineError::BadArgument {
                key: "profile".to_string(),
                reason: format!("unknown profile '{}'", profile_name),
            }
        })
    }))?;

    info!(
        tiles = summary.tiles_written,
        output = %summary.output.display(),
        "finished"
    );
    Ok(())
}
