//! Feature data model.
//!
//! [`SourceFeature`] is what readers hand to profiles: tags plus a lazily
//! materialized geometry. [`RenderedFeature`] is what the renderer emits per
//! tile: quantized integer geometry plus attributes, serializable into the
//! external sort's record payload. [`FeatureCollector`] is the fluent surface
//! profiles use to declare output features.

mod collector;
mod rendered;
mod source;
mod value;

pub use collector::{FeatureCollector, FeatureSpec, GeometryIntent};
pub use rendered::{
    LayerRegistry, PayloadError, RenderedFeature, SortKey, TileGeometry, TilePolygon,
};
pub use source::{ElementKind, RawGeometry, RelationRole, SourceFeature};
pub use value::FieldValue;
