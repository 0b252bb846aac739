//! Run configuration.
//!
//! A run is configured by a flat `key=value` argument record (the CLI passes
//! its trailing arguments straight through). [`Arguments`] is the typed view
//! over that record; [`PipelineConfig`] is the validated result the engine
//! consumes. Validation happens before any work begins so every bad value is
//! reported as `BadArgument` citing the offending key.

mod args;
mod duration;

pub use args::Arguments;
pub use duration::parse_duration;

use std::path::PathBuf;
use std::time::Duration;

use crate::coord::MAX_ZOOM;
use crate::error::PipelineError;

/// Geographic bounds `(min_lon, min_lat, max_lon, max_lat)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Bounds {
    pub const WORLD: Bounds = Bounds {
        min_lon: -180.0,
        min_lat: -85.05112878,
        max_lon: 180.0,
        max_lat: 85.05112878,
    };

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }
}

/// Validated configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// OSM PBF input.
    pub input: PathBuf,
    /// Lake centerline shapefile, if provided.
    pub centerline: Option<PathBuf>,
    /// Natural Earth SQLite dump, if provided.
    pub natural_earth: Option<PathBuf>,
    /// Water polygons shapefile, if provided.
    pub water_polygons: Option<PathBuf>,
    /// MBTiles output.
    pub output: PathBuf,
    /// Scratch directory for the node store and sort chunks.
    pub tmpdir: PathBuf,
    /// Render bounds; `None` means infer from the OSM header.
    pub bounds: Option<Bounds>,
    pub threads: usize,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// BCP-47 tags for `name:*` attribute output, in priority order.
    pub name_languages: Vec<String>,
    pub fetch_wikidata: bool,
    pub use_wikidata: bool,
    pub wikidata_cache: PathBuf,
    pub defer_mbtiles_index_creation: bool,
    pub optimize_db: bool,
    /// Cadence of progress log lines.
    pub log_interval: Duration,
    /// Simplification tolerance in 256-scale pixels.
    pub simplify_tolerance_px: f64,
    /// Sort buffer budget across all writer threads, in bytes.
    pub sort_buffer_bytes: usize,
    /// Tiles per MBTiles insert transaction.
    pub txn_tiles: usize,
}

const RECOGNIZED_KEYS: &[&str] = &[
    "input",
    "centerline",
    "natural_earth",
    "water_polygons",
    "output",
    "tmpdir",
    "bounds",
    "threads",
    "minzoom",
    "maxzoom",
    "name_languages",
    "fetch_wikidata",
    "use_wikidata",
    "wikidata_cache",
    "defer_mbtiles_index_creation",
    "optimize_db",
    "loginterval",
    "simplify_tolerance",
    "sort_buffer",
    "txn_tiles",
];

impl PipelineConfig {
    /// Validates the argument record into a runnable configuration.
    ///
    /// Everything wrong with the record is a `BadArgument` except a
    /// nonexistent `input` path, which is `MissingInput` so the CLI can map
    /// it to its own exit code.
    pub fn from_arguments(args: &Arguments) -> Result<Self, PipelineError> {
        for key in args.keys() {
            if !RECOGNIZED_KEYS.contains(&key) {
                return Err(PipelineError::BadArgument {
                    key: key.to_string(),
                    reason: "unrecognized key".to_string(),
                });
            }
        }

        let input = PathBuf::from(args.required("input")?);
        let output = PathBuf::from(args.required("output")?);

        let min_zoom = args.get_parsed::<u8>("minzoom")?.unwrap_or(0);
        let max_zoom = args.get_parsed::<u8>("maxzoom")?.unwrap_or(MAX_ZOOM);
        if max_zoom > MAX_ZOOM {
            return Err(PipelineError::BadArgument {
                key: "maxzoom".to_string(),
                reason: format!("must be <= {}", MAX_ZOOM),
            });
        }
        if min_zoom > max_zoom {
            return Err(PipelineError::BadArgument {
                key: "minzoom".to_string(),
                reason: format!("minzoom {} exceeds maxzoom {}", min_zoom, max_zoom),
            });
        }

        let threads = match args.get_parsed::<usize>("threads")? {
            Some(0) => {
                return Err(PipelineError::BadArgument {
                    key: "threads".to_string(),
                    reason: "must be at least 1".to_string(),
                })
            }
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };

        let bounds = match args.get("bounds") {
            None => None,
            Some("world") => Some(Bounds::WORLD),
            Some(spec) => Some(parse_bounds(spec)?),
        };

        let log_interval = match args.get("loginterval") {
            None => Duration::from_secs(10),
            Some(spec) => parse_duration(spec).map_err(|reason| PipelineError::BadArgument {
                key: "loginterval".to_string(),
                reason,
            })?,
        };

        let name_languages = args
            .get("name_languages")
            .unwrap_or("en")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            input,
            centerline: args.get("centerline").map(PathBuf::from),
            natural_earth: args.get("natural_earth").map(PathBuf::from),
            water_polygons: args.get("water_polygons").map(PathBuf::from),
            output,
            tmpdir: args
                .get("tmpdir")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/tmp")),
            bounds,
            threads,
            min_zoom,
            max_zoom,
            name_languages,
            fetch_wikidata: args.get_bool("fetch_wikidata")?.unwrap_or(false),
            use_wikidata: args.get_bool("use_wikidata")?.unwrap_or(true),
            wikidata_cache: args
                .get("wikidata_cache")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/sources/wikidata_names.json")),
            defer_mbtiles_index_creation: args
                .get_bool("defer_mbtiles_index_creation")?
                .unwrap_or(false),
            optimize_db: args.get_bool("optimize_db")?.unwrap_or(false),
            log_interval,
            simplify_tolerance_px: args
                .get_parsed::<f64>("simplify_tolerance")?
                .unwrap_or(0.0625),
            sort_buffer_bytes: args
                .get_parsed::<usize>("sort_buffer")?
                .unwrap_or(1 << 30),
            txn_tiles: args.get_parsed::<usize>("txn_tiles")?.unwrap_or(1000),
        };
        Ok(config)
    }

    /// Checks input existence; separate from parsing so argument errors win.
    pub fn check_inputs(&self) -> Result<(), PipelineError> {
        for path in [Some(&self.input), self.centerline.as_ref()]
            .into_iter()
            .flatten()
            .chain(self.natural_earth.iter())
            .chain(self.water_polygons.iter())
        {
            if !path.exists() {
                return Err(PipelineError::MissingInput(path.clone()));
            }
        }
        Ok(())
    }

    /// Per-writer sort buffer share.
    pub fn chunk_bytes(&self) -> usize {
        (self.sort_buffer_bytes / self.threads.max(1)).max(1 << 20)
    }
}

fn parse_bounds(spec: &str) -> Result<Bounds, PipelineError> {
    let bad = |reason: &str| PipelineError::BadArgument {
        key: "bounds".to_string(),
        reason: reason.to_string(),
    };
    let parts: Vec<f64> = spec
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| bad("expected four numbers: minLon,minLat,maxLon,maxLat"))?;
    if parts.len() != 4 {
        return Err(bad("expected four numbers: minLon,minLat,maxLon,maxLat"));
    }
    let bounds = Bounds {
        min_lon: parts[0],
        min_lat: parts[1],
        max_lon: parts[2],
        max_lat: parts[3],
    };
    if bounds.min_lon >= bounds.max_lon || bounds.min_lat >= bounds.max_lat {
        return Err(bad("min must be strictly less than max"));
    }
    if bounds.min_lon < -180.0 || bounds.max_lon > 180.0 {
        return Err(bad("longitude outside [-180, 180]"));
    }
    Ok(bounds)
}
