//! Conversion of raw relay events into job listings and retractions.

use std::collections::BTreeSet;

use crate::{
    error::Error,
    event::{Event, Tag, KIND_DELETION},
    listing::{normalize_skill, JobListing},
};

/// Kind carrying job listings on the network.
pub const DEFAULT_JOB_KIND: u32 = 9993;

/// Why an event did not become a listing.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Not a job listing at all; ignored silently.
    NotAJobListing { kind: u32 },
    /// A job-listing event that failed validation.
    Malformed(String),
}

impl From<Rejection> for Error {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::NotAJobListing { kind } => {
                Error::MalformedEvent(format!("kind {kind} is not a job listing"))
            }
            Rejection::Malformed(reason) => Error::MalformedEvent(reason),
        }
    }
}

/// A publisher's request to delete some of its listings (NIP-09).
#[derive(Debug, Clone, PartialEq)]
pub struct Retraction {
    pub author: String,
    /// `created_at` of the deletion request.
    pub at: u64,
    /// Slots addressed through `a` tags.
    pub slots: Vec<String>,
    /// Specific events addressed through `e` tags.
    pub event_ids: Vec<String>,
}

/// Outcome of classifying an accepted event.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Listing(JobListing),
    Retraction(Retraction),
}

#[derive(Debug, Clone, Copy)]
pub struct ListingParser {
    job_kind: u32,
}

impl Default for ListingParser {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_KIND)
    }
}

impl ListingParser {
    pub fn new(job_kind: u32) -> Self {
        Self { job_kind }
    }

    /// Route an event to the listing or retraction parser.
    pub fn classify(&self, ev: &Event) -> Result<Parsed, Rejection> {
        if ev.kind == KIND_DELETION {
            return self.retraction(ev).map(Parsed::Retraction);
        }
        self.parse(ev).map(Parsed::Listing)
    }

    /// Build a listing from a job event.
    pub fn parse(&self, ev: &Event) -> Result<JobListing, Rejection> {
        if ev.kind != self.job_kind {
            return Err(Rejection::NotAJobListing { kind: ev.kind });
        }

        let title = text_tag(ev, "title");
        let skills: BTreeSet<String> = ev
            .tags_named("skill")
            .filter_map(Tag::value)
            .filter_map(normalize_skill)
            .collect();
        if title.is_none() && skills.is_empty() {
            return Err(Rejection::Malformed(format!(
                "event {} has neither title nor skills",
                ev.id
            )));
        }

        let slot = text_tag(ev, "d")
            .or_else(|| text_tag(ev, "job-id"))
            .unwrap_or_else(|| ev.id.clone());
        let salary = ev.tags_named("salary").next().map(parse_salary).unwrap_or_default();

        Ok(JobListing {
            id: ev.id.clone(),
            author: ev.pubkey.clone(),
            slot,
            revision: ev.created_at,
            title,
            company: text_tag(ev, "company"),
            location: text_tag(ev, "location"),
            job_type: text_tag(ev, "employment-type"),
            skills,
            salary_min: salary.min,
            salary_max: salary.max,
            currency: salary.currency,
            salary_period: salary.period,
            description: ev.content.clone(),
            raw_tags: ev.tags.iter().map(|Tag(fields)| fields.clone()).collect(),
        })
    }

    /// Extract the job-listing targets of a deletion request.
    pub fn retraction(&self, ev: &Event) -> Result<Retraction, Rejection> {
        if ev.kind != KIND_DELETION {
            return Err(Rejection::NotAJobListing { kind: ev.kind });
        }
        let slots: Vec<String> = ev
            .tags_named("a")
            .filter_map(Tag::value)
            .filter_map(|coord| {
                let mut parts = coord.splitn(3, ':');
                let kind = parts.next()?.parse::<u32>().ok()?;
                let author = parts.next()?;
                let slot = parts.next()?;
                // Authors may only delete their own listings.
                (kind == self.job_kind && author == ev.pubkey && !slot.is_empty())
                    .then(|| slot.to_string())
            })
            .collect();
        let event_ids: Vec<String> = ev
            .tags_named("e")
            .filter_map(Tag::value)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if slots.is_empty() && event_ids.is_empty() {
            return Err(Rejection::NotAJobListing { kind: ev.kind });
        }
        Ok(Retraction {
            author: ev.pubkey.clone(),
            at: ev.created_at,
            slots,
            event_ids,
        })
    }
}

/// Non-empty, trimmed value of the first tag named `name`.
fn text_tag(ev: &Event, name: &str) -> Option<String> {
    ev.tag_value(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Default, PartialEq)]
struct Salary {
    min: Option<f64>,
    max: Option<f64>,
    currency: Option<String>,
    period: Option<String>,
}

/// Parse `["salary", min, max, currency, period]`.
///
/// Any present bound that is not a finite non-negative number, or a range with
/// `min > max`, drops the whole salary. One missing bound is kept as a
/// partial range.
fn parse_salary(tag: &Tag) -> Salary {
    let field = |i: usize| {
        tag.0
            .get(i)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    };
    let bound = |i: usize| -> Result<Option<f64>, ()> {
        match field(i) {
            None => Ok(None),
            Some(raw) => match parse_amount(raw) {
                Some(v) if v.is_finite() && v >= 0.0 => Ok(Some(v)),
                _ => Err(()),
            },
        }
    };
    let (Ok(min), Ok(max)) = (bound(1), bound(2)) else {
        return Salary::default();
    };
    if let (Some(lo), Some(hi)) = (min, max) {
        if lo > hi {
            return Salary::default();
        }
    }
    if min.is_none() && max.is_none() {
        return Salary::default();
    }
    Salary {
        min,
        max,
        currency: field(3).map(str::to_string),
        period: field(4).map(str::to_string),
    }
}

/// A number that may group its integer part in thousands: `150,000.50`.
/// Commas anywhere else reject the amount.
fn parse_amount(raw: &str) -> Option<f64> {
    let (int, frac) = match raw.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (raw, None),
    };
    if frac.is_some_and(|f| f.contains(',')) {
        return None;
    }
    let mut groups = int.split(',');
    let first = groups.next()?;
    let mut digits = first.to_string();
    for group in groups {
        let well_formed = (1..=3).contains(&first.trim_start_matches(['+', '-']).len())
            && group.len() == 3
            && group.bytes().all(|b| b.is_ascii_digit());
        if !well_formed {
            return None;
        }
        digits.push_str(group);
    }
    if let Some(frac) = frac {
        digits.push('.');
        digits.push_str(frac);
    }
    digits.parse().ok()
}
