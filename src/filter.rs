//! Subscription filters in the NIP-01 wire shape.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::event::Event;

/// Filter parameters sent with a `REQ`.
///
/// Tag filters are keyed by the bare tag name (`d`, `p`, ...) and written on
/// the wire with a `#` prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Restrict to specific authors.
    pub authors: Option<Vec<String>>,
    /// Restrict to event kinds.
    pub kinds: Option<Vec<u32>>,
    /// Tag filters, e.g. `d -> [slug]`.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Lower bound for `created_at`.
    pub since: Option<u64>,
    /// Upper bound for `created_at`.
    pub until: Option<u64>,
    /// Maximum number of stored events requested.
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds.get_or_insert_with(Vec::new).extend(kinds);
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(author.into());
        self
    }

    /// Add a value to the `#name` tag filter.
    pub fn tag(mut self, name: &str, value: impl Into<String>) -> Self {
        let name = name.trim_start_matches('#').to_string();
        self.tags.entry(name).or_default().push(value.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Wire representation of the filter object.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(authors) = self.authors.as_ref().filter(|a| !a.is_empty()) {
            map.insert(
                "authors".into(),
                Value::Array(authors.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(kinds) = self.kinds.as_ref().filter(|k| !k.is_empty()) {
            map.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            map.insert(
                format!("#{tag}"),
                Value::Array(values.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number((limit as u64).into()));
        }
        map
    }

    /// Parse a filter object received over the wire. Unknown fields are ignored.
    pub fn from_value(val: &Value) -> Self {
        let strings = |v: &Value| -> Vec<String> {
            v.as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        let authors = val.get("authors").map(strings);
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().map(|u| u as u32))
                .collect()
        });
        let tags = val
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| {
                        k.strip_prefix('#').map(|name| (name.to_string(), strings(v)))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Filter {
            authors,
            kinds,
            tags,
            since: val.get("since").and_then(|v| v.as_u64()),
            until: val.get("until").and_then(|v| v.as_u64()),
            limit: val.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize),
        }
    }

    /// Whether `ev` satisfies every constraint except `limit`.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(authors) = &self.authors {
            if !authors.contains(&ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let hit = ev.tags.iter().any(|t| {
                t.name() == Some(name.as_str())
                    && t.value().map_or(false, |v| values.iter().any(|x| x == v))
            });
            if !hit {
                return false;
            }
        }
        self.since.map_or(true, |s| ev.created_at >= s)
            && self.until.map_or(true, |u| ev.created_at <= u)
    }
}
