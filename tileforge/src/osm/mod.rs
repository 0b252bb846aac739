//! OpenStreetMap PBF ingestion.
//!
//! Two passes over the same file: pass-1 builds the node location store and
//! the relation index, pass-2 streams full features with way geometry
//! rehydrated from the store. The store requires nondecreasing node ids, so
//! pass-1 decodes blocks in parallel and restores file order through a
//! reorder buffer in front of the single writer.

mod node_store;
mod reader;
mod relations;

pub use node_store::{NodeStoreReader, NodeStoreWriter};
pub use reader::OsmReader;
pub use relations::{AssembledRelation, RelationAssembler, RelationIndex, RelationInfo};
