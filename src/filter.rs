//! Subscription filters and `REQ` message encoding.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

use crate::event::KIND_DELETION;

/// One NIP-01 filter. Fields left empty are omitted from the wire form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Restrict to event kinds.
    pub kinds: Vec<u32>,
    /// Restrict to specific authors.
    pub authors: Vec<String>,
    /// Tag predicates keyed by tag name without the `#` prefix.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Lower bound for `created_at`.
    pub since: Option<u64>,
}

impl Filter {
    pub fn kind(kind: u32) -> Self {
        Self {
            kinds: vec![kind],
            ..Default::default()
        }
    }

    pub fn authors(mut self, authors: &[String]) -> Self {
        self.authors = authors.to_vec();
        self
    }

    pub fn tag(mut self, name: &str, values: Vec<String>) -> Self {
        self.tags.insert(name.trim_start_matches('#').to_string(), values);
        self
    }

    pub fn since(mut self, since: Option<u64>) -> Self {
        self.since = since;
        self
    }

    /// Convert the filter into the JSON object carried by `REQ`.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if !self.kinds.is_empty() {
            map.insert(
                "kinds".into(),
                Value::Array(self.kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        if !self.authors.is_empty() {
            map.insert(
                "authors".into(),
                Value::Array(self.authors.iter().cloned().map(Value::String).collect()),
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
        map
    }
}

/// The set of filters issued together in one `REQ`; an event matching any of
/// them is delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub filters: Vec<Filter>,
}

impl Subscription {
    pub fn new(filter: Filter) -> Self {
        Self {
            filters: vec![filter],
        }
    }

    pub fn or(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Listings of `job_kind` plus the deletion requests that target them.
    pub fn job_listings(job_kind: u32, authors: &[String], since: Option<u64>) -> Self {
        Self::new(Filter::kind(job_kind).authors(authors).since(since)).or(
            Filter::kind(KIND_DELETION)
                .authors(authors)
                .tag("k", vec![job_kind.to_string()])
                .since(since),
        )
    }

    /// Encode as `["REQ", <sub_id>, <filter>...]`.
    pub fn to_req(&self, sub_id: &str) -> Value {
        let mut arr = vec![Value::String("REQ".into()), Value::String(sub_id.into())];
        arr.extend(self.filters.iter().map(|f| Value::Object(f.to_json())));
        Value::Array(arr)
    }
}

/// Derive a short, stable subscription id for a relay URL.
pub fn subscription_id(relay_url: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(relay_url.as_bytes());
    let hash = hex::encode(hasher.finalize());
    format!("jobs-{}", &hash[..8])
}

/// Encode `["CLOSE", <sub_id>]`.
pub fn close_message(sub_id: &str) -> Value {
    Value::Array(vec![
        Value::String("CLOSE".into()),
        Value::String(sub_id.into()),
    ])
}
