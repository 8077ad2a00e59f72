//! Job listing model.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Identity of "the same listing over time": publisher plus logical slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub author: String,
    pub slot: String,
}

impl SlotKey {
    pub fn new(author: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            slot: slot.into(),
        }
    }
}

/// One current job posting.
///
/// Listings are replaced whole; no field is ever patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListing {
    /// Event id of the revision currently held.
    pub id: String,
    /// Publisher public key (hex).
    pub author: String,
    /// Logical identifier within the author's listings.
    pub slot: String,
    /// Publisher-supplied `created_at`; higher wins.
    pub revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    /// Normalized skill tokens.
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_period: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Event tags, verbatim.
    #[serde(default)]
    pub raw_tags: Vec<Vec<String>>,
}

impl JobListing {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.author.clone(), self.slot.clone())
    }
}

/// Normalize a skill token: trimmed and lower-cased. Blank input yields `None`.
pub fn normalize_skill(raw: &str) -> Option<String> {
    let token = raw.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_lowercase())
    }
}

#[cfg(test)]
pub(crate) fn listing(id: &str, author: &str, slot: &str, revision: u64, skills: &[&str]) -> JobListing {
    JobListing {
        id: id.into(),
        author: author.into(),
        slot: slot.into(),
        revision,
        title: Some(format!("Job {id}")),
        company: None,
        location: None,
        job_type: None,
        skills: skills.iter().filter_map(|s| normalize_skill(s)).collect(),
        salary_min: None,
        salary_max: None,
        currency: None,
        salary_period: None,
        description: String::new(),
        raw_tags: vec![],
    }
}
