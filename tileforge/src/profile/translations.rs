//! Name localization.
//!
//! Builds the `name` / `name:lang` attribute set for label layers from a
//! feature's tags, falling back to cached wikidata labels where OSM has no
//! translation. Constructed before the profile and injected into it, so the
//! dependency runs one way.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::feature::FieldValue;
use crate::wikidata::{parse_qid, WikidataCache};

/// The wikidata cache arrives only after pass-1 (the fetch stage sits
/// between the passes), so the slot is write-once and starts empty.
pub struct Translations {
    languages: Vec<String>,
    wikidata: OnceLock<Arc<WikidataCache>>,
}

impl Translations {
    pub fn new(languages: Vec<String>, wikidata: Option<Arc<WikidataCache>>) -> Self {
        let slot = OnceLock::new();
        if let Some(cache) = wikidata {
            let _ = slot.set(cache);
        }
        Self {
            languages,
            wikidata: slot,
        }
    }

    /// Installs the wikidata cache; later calls are ignored.
    pub fn set_wikidata(&self, cache: Arc<WikidataCache>) {
        let _ = self.wikidata.set(cache);
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    /// Name attributes for a feature: `name` (the local name) plus one
    /// `name:lang` per configured language that resolves, OSM tags first,
    /// wikidata labels second.
    pub fn names(&self, tags: &HashMap<String, FieldValue>) -> Vec<(String, FieldValue)> {
        let mut out = Vec::new();
        let Some(local) = tags.get("name").and_then(FieldValue::as_str) else {
            return out;
        };
        out.push(("name".to_string(), FieldValue::from(local)));

        let qid = tags
            .get("wikidata")
            .and_then(FieldValue::as_str)
            .and_then(parse_qid);
        for language in &self.languages {
            let tag_key = format!("name:{}", language);
            let translated = tags
                .get(&tag_key)
                .and_then(FieldValue::as_str)
                .or_else(|| self.wikidata.get()?.label(qid?, language));
            if let Some(translated) = translated {
                if translated != local {
                    out.push((tag_key, FieldValue::from(translated)));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, FieldValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::from(*v)))
            .collect()
    }

    fn translations(langs: &[&str]) -> Translations {
        Translations::new(langs.iter().map(|s| s.to_string()).collect(), None)
    }

    #[test]
    fn test_no_name_no_attrs() {
        let t = translations(&["en"]);
        assert!(t.names(&tags(&[("highway", "residential")])).is_empty());
    }

    #[test]
    fn test_osm_translations_win() {
        let t = translations(&["en", "de"]);
        let names = t.names(&tags(&[
            ("name", "Wien"),
            ("name:en", "Vienna"),
            ("name:de", "Wien"),
        ]));
        // `name:de` equals the local name, so only `name` and `name:en`.
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], ("name".to_string(), FieldValue::from("Wien")));
        assert_eq!(names[1], ("name:en".to_string(), FieldValue::from("Vienna")));
    }

    #[test]
    fn test_wikidata_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(
            &path,
            concat!(r#"{"qid":"Q64","labels":{"cs":"Berlín"}}"#, "\n"),
        )
        .unwrap();
        let cache = Arc::new(WikidataCache::load(&path).unwrap());
        let t = Translations::new(vec!["cs".to_string()], Some(cache));
        let names = t.names(&tags(&[("name", "Berlin"), ("wikidata", "Q64")]));
        assert!(names.contains(&("name:cs".to_string(), FieldValue::from("Berlín"))));
    }
}
