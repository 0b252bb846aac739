//! Tileforge - batch vector tile rendering.
//!
//! Transforms large geospatial sources (OpenStreetMap PBF extracts, ESRI
//! shapefiles, a Natural Earth SQLite dump) into a single MBTiles archive
//! of gzip-compressed Mapbox Vector Tiles, on one machine, with memory
//! bounded regardless of input size.
//!
//! # High-Level API
//!
//! ```ignore
//! use tileforge::config::{Arguments, PipelineConfig};
//! use tileforge::pipeline::PipelineEngine;
//! use tileforge::profile::create_profile;
//!
//! let args = Arguments::parse(std::env::args().skip(2))?;
//! let config = PipelineConfig::from_arguments(&args)?;
//! let engine = PipelineEngine::new(config);
//! let summary = engine.run(Box::new(|translations| {
//!     create_profile("basic", translations).ok_or_else(|| {
//!         tileforge::error::PipelineError::BadArgument {
//!             key: "profile".to_string(),
//!             reason: "unknown profile".to_string(),
//!         }
//!     })
//! }))?;
//! ```
//!
//! The pipeline runs in stages: pass-1 indexes node locations and
//! relations from the PBF, pass-2 classifies and renders every feature
//! into per-tile geometries spooled through an external merge sort keyed
//! by tile id, and the emit stage groups, encodes, and writes tiles into
//! SQLite in spatial order.

pub mod config;
pub mod coord;
pub mod error;
pub mod feature;
pub mod group;
pub mod logging;
pub mod mbtiles;
pub mod mvt;
pub mod osm;
pub mod pipeline;
pub mod profile;
pub mod render;
pub mod sort;
pub mod sources;
pub mod stats;
pub mod wikidata;

/// Crate version, synchronized across the workspace.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
