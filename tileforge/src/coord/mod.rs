//! Tile coordinates and Web Mercator math.
//!
//! Everything downstream of the renderer is keyed by a 32-bit tile id whose
//! ascending order walks a Hilbert curve within each zoom, zooms concatenated
//! ascending. Consecutive ids are spatially adjacent tiles, which keeps the
//! MBTiles writer's working set small when it consumes the sorted feature
//! stream.

mod hilbert;
mod mercator;
mod tile;

pub use mercator::{lat_to_world_y, lon_to_world_x, world_to_lon_lat, MAX_LAT, MIN_LAT};
pub use tile::{TileCoord, TileCoordError, MAX_ZOOM, TILE_EXTENT};
