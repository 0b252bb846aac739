//! Schema profiles: the plug-in surface that classifies source features
//! into output layers.
//!
//! The engine is schema-agnostic; everything layer-specific lives behind
//! [`Profile`]. Profiles are constructed by name through [`create_profile`]
//! with their collaborators (translations) injected, and are shared
//! read-only across all render workers.

mod basic;
mod matcher;
mod translations;

pub use basic::BasicProfile;
pub use matcher::{match_any, match_field, TagExpression, TagIndex};
pub use translations::Translations;

use std::collections::HashMap;
use std::sync::Arc;

use crate::feature::{FeatureCollector, FieldValue, SourceFeature};
use crate::group::MergeMode;

/// A tile schema. Implementations must be cheap to call per feature and
/// safe to share across worker threads.
pub trait Profile: Send + Sync {
    fn name(&self) -> &'static str;

    /// Classifies one source feature, declaring output features on the
    /// collector. Called for every feature of every pass-2 source.
    fn process_feature(&self, source: &SourceFeature, collector: &mut FeatureCollector);

    /// Pass-1 relation filter: `true` to index this relation so its member
    /// ways can be assembled into an area in pass-2.
    fn wants_relation(&self, tags: &HashMap<String, FieldValue>) -> bool {
        tags.get("type").and_then(FieldValue::as_str) == Some("multipolygon")
    }

    /// Layers whose per-tile features should be merged, and how.
    fn merge_layers(&self) -> HashMap<String, MergeMode> {
        HashMap::new()
    }

    /// Called once after pass-2 completes; a hook for dropping caches.
    fn release(&self) {}
}

/// Known profile names, for error messages.
pub const PROFILE_NAMES: &[&str] = &["basic"];

/// Instantiates a registered profile by name.
pub fn create_profile(name: &str, translations: Arc<Translations>) -> Option<Box<dyn Profile>> {
    match name {
        "basic" => Some(Box::new(BasicProfile::new(translations))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_knows_basic() {
        let translations = Arc::new(Translations::new(vec!["en".to_string()], None));
        assert!(create_profile("basic", Arc::clone(&translations)).is_some());
        assert!(create_profile("nope", translations).is_none());
    }

    #[test]
    fn test_default_relation_filter_is_multipolygon() {
        struct Noop;
        impl Profile for Noop {
            fn name(&self) -> &'static str {
                "noop"
            }
            fn process_feature(&self, _: &SourceFeature, _: &mut FeatureCollector) {}
        }
        let mut tags = HashMap::new();
        tags.insert("type".to_string(), FieldValue::from("multipolygon"));
        assert!(Noop.wants_relation(&tags));
        tags.insert("type".to_string(), FieldValue::from("route"));
        assert!(!Noop.wants_relation(&tags));
    }
}
