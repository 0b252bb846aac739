//! Tag-expression matching compiled into an inverted index.
//!
//! Profiles describe which features they want as boolean expressions over
//! tags. A [`TagIndex`] compiles a list of `(label, expression)` pairs so
//! that matching a feature costs a hash probe per feature tag instead of an
//! evaluation of every expression: each entry registers the `(key, value)`
//! pairs that could possibly trigger it, and only triggered entries are
//! fully evaluated.

use std::collections::{HashMap, HashSet};

use crate::feature::FieldValue;

/// A boolean expression over a feature's tags.
#[derive(Debug, Clone)]
pub enum TagExpression {
    /// Key present with one of these values.
    MatchAny { key: String, values: Vec<String> },
    /// Key present with any value.
    MatchField { key: String },
    And(Vec<TagExpression>),
    Or(Vec<TagExpression>),
    Not(Box<TagExpression>),
}

impl TagExpression {
    pub fn matches(&self, tags: &HashMap<String, FieldValue>) -> bool {
        match self {
            TagExpression::MatchAny { key, values } => tags
                .get(key)
                .map(|v| v.to_string())
                .is_some_and(|v| values.iter().any(|want| want == &v)),
            TagExpression::MatchField { key } => tags.contains_key(key),
            TagExpression::And(children) => children.iter().all(|c| c.matches(tags)),
            TagExpression::Or(children) => children.iter().any(|c| c.matches(tags)),
            TagExpression::Not(child) => !child.matches(tags),
        }
    }

    /// `(key, Some(value))` pairs that can trigger this expression, or
    /// `(key, None)` for presence triggers. `None` overall means the
    /// expression can match a feature that has none of its keys (e.g. a
    /// bare negation), so it must always be evaluated.
    fn triggers(&self) -> Option<Vec<(String, Option<String>)>> {
        match self {
            TagExpression::MatchAny { key, values } => Some(
                values
                    .iter()
                    .map(|v| (key.clone(), Some(v.clone())))
                    .collect(),
            ),
            TagExpression::MatchField { key } => Some(vec![(key.clone(), None)]),
            TagExpression::Or(children) => {
                let mut out = Vec::new();
                for child in children {
                    out.extend(child.triggers()?);
                }
                Some(out)
            }
            // Any conjunct's triggers are necessary conditions; use the
            // first that has them.
            TagExpression::And(children) => children.iter().find_map(|c| c.triggers()),
            TagExpression::Not(_) => None,
        }
    }
}

/// Convenience constructors mirroring how profiles read.
pub fn match_any(key: &str, values: &[&str]) -> TagExpression {
    TagExpression::MatchAny {
        key: key.to_string(),
        values: values.iter().map(|v| v.to_string()).collect(),
    }
}

pub fn match_field(key: &str) -> TagExpression {
    TagExpression::MatchField {
        key: key.to_string(),
    }
}

/// Compiled multi-expression index; `T` is the label type.
#[derive(Debug)]
pub struct TagIndex<T> {
    entries: Vec<(T, TagExpression)>,
    by_key_value: HashMap<(String, String), Vec<usize>>,
    by_key: HashMap<String, Vec<usize>>,
    always_check: Vec<usize>,
}

impl<T> TagIndex<T> {
    pub fn build(entries: Vec<(T, TagExpression)>) -> Self {
        let mut by_key_value: HashMap<(String, String), Vec<usize>> = HashMap::new();
        let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
        let mut always_check = Vec::new();
        for (idx, (_, expression)) in entries.iter().enumerate() {
            match expression.triggers() {
                None => always_check.push(idx),
                Some(triggers) => {
                    for (key, value) in triggers {
                        match value {
                            Some(value) => {
                                by_key_value.entry((key, value)).or_default().push(idx)
                            }
                            None => by_key.entry(key).or_default().push(idx),
                        }
                    }
                }
            }
        }
        Self {
            entries,
            by_key_value,
            by_key,
            always_check,
        }
    }

    /// Labels of all entries matching the tags, in registration order.
    pub fn matches(&self, tags: &HashMap<String, FieldValue>) -> Vec<&T> {
        let mut candidates: HashSet<usize> = self.always_check.iter().copied().collect();
        for (key, value) in tags {
            if let Some(indices) = self.by_key.get(key) {
                candidates.extend(indices);
            }
            let pair = (key.clone(), value.to_string());
            if let Some(indices) = self.by_key_value.get(&pair) {
                candidates.extend(indices);
            }
        }
        let mut hits: Vec<usize> = candidates
            .into_iter()
            .filter(|&idx| self.entries[idx].1.matches(tags))
            .collect();
        hits.sort_unstable();
        hits.into_iter().map(|idx| &self.entries[idx].0).collect()
    }

    /// First matching label, or the fallback.
    pub fn get_or_else<'a>(
        &'a self,
        tags: &HashMap<String, FieldValue>,
        fallback: &'a T,
    ) -> &'a T {
        self.matches(tags).into_iter().next().unwrap_or(fallback)
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

    fn sample_index() -> TagIndex<&'static str> {
        TagIndex::build(vec![
            (
                "international",
                TagExpression::And(vec![
                    match_any("aerodrome", &["international"]),
                    match_field("iata"),
                ]),
            ),
            ("military", match_any("military", &["airfield", "base"])),
            (
                "not_water",
                TagExpression::Not(Box::new(match_field("water"))),
            ),
        ])
    }

    #[test]
    fn test_key_value_trigger() {
        let index = sample_index();
        let hits = index.matches(&tags(&[("military", "airfield")]));
        assert!(hits.contains(&&"military"));
    }

    #[test]
    fn test_and_requires_all_conjuncts() {
        let index = sample_index();
        let missing_iata = tags(&[("aerodrome", "international")]);
        assert!(!index.matches(&missing_iata).contains(&&"international"));
        let full = tags(&[("aerodrome", "international"), ("iata", "TXL")]);
        assert!(index.matches(&full).contains(&&"international"));
    }

    #[test]
    fn test_negation_is_always_evaluated() {
        let index = sample_index();
        assert!(index.matches(&tags(&[])).contains(&&"not_water"));
        assert!(!index.matches(&tags(&[("water", "lake")])).contains(&&"not_water"));
    }

    #[test]
    fn test_or_triggers_on_either_side() {
        let index = TagIndex::build(vec![(
            "poi",
            TagExpression::Or(vec![
                match_any("amenity", &["cafe"]),
                match_any("shop", &["bakery"]),
            ]),
        )]);
        assert_eq!(index.matches(&tags(&[("shop", "bakery")])).len(), 1);
        assert_eq!(index.matches(&tags(&[("amenity", "cafe")])).len(), 1);
        assert_eq!(index.matches(&tags(&[("shop", "butcher")])).len(), 0);
    }

    #[test]
    fn test_get_or_else_falls_back() {
        let index = sample_index();
        let fallback = "other";
        assert_eq!(
            index.get_or_else(&tags(&[("foo", "bar")]), &fallback),
            &"other"
        );
    }

    #[test]
    fn test_registration_order_is_preserved() {
        let index = TagIndex::build(vec![
            ("first", match_field("a")),
            ("second", match_field("a")),
        ]);
        let hits = index.matches(&tags(&[("a", "1")]));
        assert_eq!(hits, vec![&"first", &"second"]);
    }
}
