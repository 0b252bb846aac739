//! Wikidata label cache for name translations.
//!
//! The cache is newline-delimited JSON, one `{qid, labels}` object per line,
//! append-friendly so interrupted fetch runs lose nothing and reloadable
//! across runs. Fetching is optional (`fetch_wikidata`); a run with only
//! `use_wikidata` loads whatever the cache already has.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct CacheLine {
    qid: String,
    labels: BTreeMap<String, String>,
}

/// In-memory view of the label cache, keyed by QID.
#[derive(Debug, Default)]
pub struct WikidataCache {
    labels: HashMap<String, BTreeMap<String, String>>,
}

impl WikidataCache {
    /// Loads a cache file; a missing file is an empty cache. Unparsable
    /// lines are skipped with a warning (the file is append-crash-tolerant).
    pub fn load(path: &Path) -> Result<Self> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no wikidata cache yet");
                return Ok(Self::default());
            }
            Err(e) => return Err(PipelineError::from_io(path, e)),
        };
        let mut labels = HashMap::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| PipelineError::from_io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CacheLine>(&line) {
                Ok(entry) => {
                    labels.insert(entry.qid, entry.labels);
                }
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "skipping bad wikidata cache line");
                }
            }
        }
        info!(qids = labels.len(), "loaded wikidata cache");
        Ok(Self { labels })
    }

    pub fn label(&self, qid: &str, language: &str) -> Option<&str> {
        self.labels.get(qid)?.get(language).map(String::as_str)
    }

    pub fn contains(&self, qid: &str) -> bool {
        self.labels.contains_key(qid)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn insert(&mut self, qid: String, labels: BTreeMap<String, String>) {
        self.labels.insert(qid, labels);
    }
}

/// Fetches labels for QIDs seen in pass-1 and appends them to the cache.
pub struct WikidataFetcher {
    client: reqwest::blocking::Client,
    cache_path: PathBuf,
}

impl WikidataFetcher {
    pub fn new(cache_path: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("tileforge/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            cache_path: cache_path.into(),
        })
    }

    /// Fetches every QID not already cached, appending results to the cache
    /// file as they arrive. Individual fetch failures are warned and
    /// skipped; the run proceeds with whatever resolved.
    pub fn fetch_missing(
        &self,
        cache: &mut WikidataCache,
        qids: impl IntoIterator<Item = String>,
        languages: &[String],
    ) -> Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::from_io(parent, e))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.cache_path)
            .map_err(|e| PipelineError::from_io(&self.cache_path, e))?;
        let mut fetched = 0usize;
        for qid in qids {
            if cache.contains(&qid) {
                continue;
            }
            match self.fetch_one(&qid, languages) {
                Ok(labels) => {
                    let line = CacheLine {
                        qid: qid.clone(),
                        labels: labels.clone(),
                    };
                    let json = serde_json::to_string(&line)
                        .map_err(|e| PipelineError::Internal(e.to_string()))?;
                    writeln!(file, "{}", json)
                        .map_err(|e| PipelineError::from_io(&self.cache_path, e))?;
                    cache.insert(qid, labels);
                    fetched += 1;
                }
                Err(e) => warn!(qid = %qid, error = %e, "wikidata fetch failed"),
            }
        }
        info!(fetched, "wikidata fetch complete");
        Ok(())
    }

    fn fetch_one(&self, qid: &str, languages: &[String]) -> Result<BTreeMap<String, String>> {
        let url = format!("https://www.wikidata.org/wiki/Special:EntityData/{}.json", qid);
        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| PipelineError::Internal(format!("wikidata {}: {}", qid, e)))?;
        let mut labels = BTreeMap::new();
        if let Some(entries) = body
            .get("entities")
            .and_then(|e| e.get(qid))
            .and_then(|e| e.get("labels"))
            .and_then(|l| l.as_object())
        {
            for lang in languages {
                if let Some(value) = entries
                    .get(lang)
                    .and_then(|v| v.get("value"))
                    .and_then(|v| v.as_str())
                {
                    labels.insert(lang.clone(), value.to_string());
                }
            }
        }
        Ok(labels)
    }
}

/// Extracts a QID from a `wikidata=Q…` tag value.
pub fn parse_qid(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.len() > 1
        && value.starts_with('Q')
        && value[1..].bytes().all(|b| b.is_ascii_digit())
    {
        Some(value)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qid() {
        assert_eq!(parse_qid("Q42"), Some("Q42"));
        assert_eq!(parse_qid(" Q1 "), Some("Q1"));
        assert_eq!(parse_qid("42"), None);
        assert_eq!(parse_qid("Qabc"), None);
        assert_eq!(parse_qid("Q"), None);
    }

    #[test]
    fn test_missing_cache_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WikidataCache::load(&dir.path().join("absent.json")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_load_ndjson_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(
            &path,
            concat!(
                r#"{"qid":"Q64","labels":{"en":"Berlin","de":"Berlin"}}"#,
                "\n",
                r#"{"qid":"Q90","labels":{"en":"Paris","fr":"Paris"}}"#,
                "\n",
            ),
        )
        .unwrap();
        let cache = WikidataCache::load(&path).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.label("Q64", "en"), Some("Berlin"));
        assert_eq!(cache.label("Q90", "fr"), Some("Paris"));
        assert_eq!(cache.label("Q90", "de"), None);
    }

    #[test]
    fn test_bad_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(
            &path,
            concat!(
                r#"{"qid":"Q64","labels":{"en":"Berlin"}}"#,
                "\n",
                "{\"qid\": truncated",
                "\n",
            ),
        )
        .unwrap();
        let cache = WikidataCache::load(&path).unwrap();
        assert_eq!(cache.len(), 1);
    }
}
