//! The flat `key=value` argument record.

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::PipelineError;

/// Parsed `key=value` pairs, order-insensitive, last occurrence wins.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    values: HashMap<String, String>,
}

impl Arguments {
    /// Parses raw CLI words. Each must contain an `=`.
    pub fn parse(words: impl Iterator<Item = String>) -> Result<Self, PipelineError> {
        let mut values = HashMap::new();
        for word in words {
            match word.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    values.insert(key.to_string(), value.to_string());
                }
                _ => {
                    return Err(PipelineError::BadArgument {
                        key: word,
                        reason: "expected key=value".to_string(),
                    })
                }
            }
        }
        Ok(Self { values })
    }

    /// Builds a record directly from pairs (tests, embedding).
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn required(&self, key: &str) -> Result<&str, PipelineError> {
        self.get(key).ok_or_else(|| PipelineError::BadArgument {
            key: key.to_string(),
            reason: "required".to_string(),
        })
    }

    /// Typed accessor; absent keys are `None`, unparsable values are
    /// `BadArgument`.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, PipelineError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                PipelineError::BadArgument {
                    key: key.to_string(),
                    reason: format!("cannot parse '{}'", raw),
                }
            }),
        }
    }

    /// Boolean accessor accepting `true/false/1/0/yes/no`.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, PipelineError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => Err(PipelineError::BadArgument {
                    key: key.to_string(),
                    reason: format!("expected true/false, got '{}'", raw),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let args =
            Arguments::parse(["input=a.pbf".to_string(), "threads=4".to_string()].into_iter())
                .unwrap();
        assert_eq!(args.get("input"), Some("a.pbf"));
        assert_eq!(args.get_parsed::<usize>("threads").unwrap(), Some(4));
    }

    #[test]
    fn test_word_without_equals_is_rejected() {
        assert!(Arguments::parse(["input".to_string()].into_iter()).is_err());
    }

    #[test]
    fn test_value_may_contain_equals() {
        let args = Arguments::parse(["bounds=a=b".to_string()].into_iter()).unwrap();
        assert_eq!(args.get("bounds"), Some("a=b"));
    }

    #[test]
    fn test_bool_spellings() {
        let args = Arguments::from_pairs([("a", "yes"), ("b", "0"), ("c", "maybe")]);
        assert_eq!(args.get_bool("a").unwrap(), Some(true));
        assert_eq!(args.get_bool("b").unwrap(), Some(false));
        assert!(args.get_bool("c").is_err());
        assert_eq!(args.get_bool("missing").unwrap(), None);
    }

    #[test]
    fn test_unparsable_number_names_the_key() {
        let args = Arguments::from_pairs([("threads", "many")]);
        let err = args.get_parsed::<usize>("threads").unwrap_err();
        assert!(err.to_string().contains("threads"));
    }
}
