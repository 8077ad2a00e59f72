//! Read-only query operations backing the tool surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    listing::{normalize_skill, JobListing},
    shared::IndexReader,
    stats::{PairCount, SkillPair},
};

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 100;
const TOP_PAIRS: usize = 10;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub skill: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub employment_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchParams {
    pub fn skill(skill: impl Into<String>) -> Self {
        Self {
            skill: skill.into(),
            ..Default::default()
        }
    }
}

/// Listing without description and raw tags.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    pub skills: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub author: String,
    pub published_at: u64,
}

impl From<&JobListing> for JobSummary {
    fn from(l: &JobListing) -> Self {
        Self {
            id: l.id.clone(),
            title: l.title.clone(),
            company: l.company.clone(),
            location: l.location.clone(),
            job_type: l.job_type.clone(),
            skills: l.skills.iter().cloned().collect(),
            salary_min: l.salary_min,
            salary_max: l.salary_max,
            currency: l.currency.clone(),
            author: l.author.clone(),
            published_at: l.revision,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub listings: Vec<JobSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    /// Skills co-occurring with `skill`; empty without one.
    pub pairs: Vec<PairCount>,
    pub total_listings: usize,
    pub skill_counts: BTreeMap<String, usize>,
    pub top_pairs: Vec<SkillPair>,
    pub company_counts: BTreeMap<String, usize>,
    pub job_type_counts: BTreeMap<String, usize>,
}

/// Strip whitespace and the stray quotes agents tend to wrap arguments in.
fn clean(arg: &str) -> &str {
    arg.trim().trim_matches('"').trim()
}

fn clean_opt(arg: Option<&str>) -> Option<String> {
    arg.map(clean)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
}

fn contains_ci(field: Option<&str>, needle: &str) -> bool {
    field.is_some_and(|f| f.to_lowercase().contains(needle))
}

#[derive(Debug, Clone)]
pub struct QueryService {
    reader: IndexReader,
}

impl QueryService {
    pub fn new(reader: IndexReader) -> Self {
        Self { reader }
    }

    /// Current listings requiring a skill, most recent first.
    pub fn search_jobs(&self, params: &SearchParams) -> Result<SearchResult> {
        let skill = normalize_skill(clean(&params.skill))
            .ok_or_else(|| Error::InvalidArgument("skill must not be empty".into()))?;
        let company = clean_opt(params.company.as_deref());
        let job_type = clean_opt(params.employment_type.as_deref());
        let limit = match params.limit {
            Some(0) => return Err(Error::InvalidArgument("limit must be positive".into())),
            Some(n) => n.min(MAX_LIMIT),
            None => DEFAULT_LIMIT,
        };
        let listings: Vec<JobSummary> = self.reader.read(|index| {
            index
                .search(&skill)
                .into_iter()
                .filter(|l| {
                    company
                        .as_deref()
                        .map_or(true, |c| contains_ci(l.company.as_deref(), c))
                })
                .filter(|l| {
                    job_type
                        .as_deref()
                        .map_or(true, |t| contains_ci(l.job_type.as_deref(), t))
                })
                .take(limit)
                .map(JobSummary::from)
                .collect()
        });
        Ok(SearchResult { listings })
    }

    /// The full current listing for an event id, or failing that a job id.
    pub fn get_job_details(&self, id: &str) -> Result<JobListing> {
        let id = clean(id);
        if id.is_empty() {
            return Err(Error::InvalidArgument("job_id must not be empty".into()));
        }
        self.reader
            .read(|index| index.get(id).or_else(|| index.find_by_slot(id)).cloned())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn get_stats(&self, skill: Option<&str>) -> Result<StatsReport> {
        let skill = match skill {
            Some(raw) => Some(
                normalize_skill(clean(raw))
                    .ok_or_else(|| Error::InvalidArgument("skill must not be empty".into()))?,
            ),
            None => None,
        };
        let stats = self.reader.read(|index| index.stats());
        Ok(StatsReport {
            pairs: skill
                .as_deref()
                .map(|s| stats.pairs_with(s))
                .unwrap_or_default(),
            top_pairs: stats.top_pairs(TOP_PAIRS),
            skill,
            total_listings: stats.total_listings,
            skill_counts: stats.skill_counts,
            company_counts: stats.company_counts,
            job_type_counts: stats.job_type_counts,
        })
    }

    /// Most recent listings regardless of skill.
    pub fn latest(&self, limit: usize) -> Vec<JobSummary> {
        self.reader.read(|index| {
            index
                .latest(limit.min(MAX_LIMIT))
                .into_iter()
                .map(JobSummary::from)
                .collect()
        })
    }

    pub fn listing_count(&self) -> usize {
        self.reader.read(|index| index.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{index::JobIndex, listing::listing, shared::shared};

    fn service() -> QueryService {
        let (writer, reader) = shared(JobIndex::default());
        writer.write(|idx| {
            let mut a = listing("a1", "k1", "s1", 3, &["Rust", "Python"]);
            a.company = Some("Acme Corp".into());
            a.job_type = Some("full-time".into());
            a.salary_min = Some(100000.0);
            a.currency = Some("USD".into());
            a.description = "Long text".into();
            idx.upsert(a);
            let mut b = listing("b1", "k2", "s1", 5, &["rust", "go"]);
            b.company = Some("Globex".into());
            b.job_type = Some("contract".into());
            idx.upsert(b);
            idx.upsert(listing("c1", "k3", "s1", 1, &["python"]));
        });
        QueryService::new(reader)
    }

    fn ids(result: &SearchResult) -> Vec<&str> {
        result.listings.iter().map(|l| l.id.as_str()).collect()
    }

    #[test]
    fn search_by_skill() {
        let q = service();
        let res = q.search_jobs(&SearchParams::skill("RUST")).unwrap();
        assert_eq!(ids(&res), vec!["b1", "a1"]);
        let res = q.search_jobs(&SearchParams::skill("\"python\"")).unwrap();
        assert_eq!(ids(&res), vec!["a1", "c1"]);
    }

    #[test]
    fn unknown_skill_is_empty_not_error() {
        let q = service();
        assert!(q.search_jobs(&SearchParams::skill("cobol")).unwrap().listings.is_empty());
    }

    #[test]
    fn empty_skill_is_invalid() {
        let q = service();
        for skill in ["", "   ", "\"\""] {
            let err = q.search_jobs(&SearchParams::skill(skill)).unwrap_err();
            assert_eq!(err.kind(), "InvalidArgument");
        }
    }

    #[test]
    fn filters_and_limit() {
        let q = service();
        let params = SearchParams {
            company: Some("acme".into()),
            ..SearchParams::skill("rust")
        };
        assert_eq!(ids(&q.search_jobs(&params).unwrap()), vec!["a1"]);

        let params = SearchParams {
            employment_type: Some("Contract".into()),
            ..SearchParams::skill("rust")
        };
        assert_eq!(ids(&q.search_jobs(&params).unwrap()), vec!["b1"]);

        let params = SearchParams {
            limit: Some(1),
            company: Some("\"\"".into()),
            ..SearchParams::skill("rust")
        };
        assert_eq!(ids(&q.search_jobs(&params).unwrap()), vec!["b1"]);

        let params = SearchParams {
            limit: Some(0),
            ..SearchParams::skill("rust")
        };
        assert!(q.search_jobs(&params).is_err());
    }

    #[test]
    fn summaries_omit_description_and_absent_salary() {
        let q = service();
        let res = q.search_jobs(&SearchParams::skill("go")).unwrap();
        let v = serde_json::to_value(&res).unwrap();
        let first = &v["listings"][0];
        assert!(first.get("description").is_none());
        assert!(first.get("rawTags").is_none());
        assert!(first.get("salaryMin").is_none());
        assert_eq!(first["publishedAt"], 5);
        assert_eq!(first["skills"], serde_json::json!(["go", "rust"]));
    }

    #[test]
    fn details_are_idempotent() {
        let q = service();
        let first = q.get_job_details("a1").unwrap();
        assert_eq!(first, q.get_job_details("a1").unwrap());
        assert_eq!(first.description, "Long text");
        assert_eq!(q.get_job_details("zz").unwrap_err().kind(), "NotFound");
        assert_eq!(q.get_job_details("s1").unwrap().id, "b1");
        assert_eq!(q.get_job_details(" ").unwrap_err().kind(), "InvalidArgument");
    }

    #[test]
    fn stats_for_skill() {
        let q = service();
        let report = q.get_stats(Some("Rust")).unwrap();
        assert_eq!(report.skill.as_deref(), Some("rust"));
        assert_eq!(report.total_listings, 3);
        let pairs: Vec<(&str, usize)> = report.pairs.iter().map(|p| (p.skill.as_str(), p.count)).collect();
        assert_eq!(pairs, vec![("go", 1), ("python", 1)]);
        assert_eq!(report.skill_counts["rust"], 2);
        assert_eq!(report.company_counts["Globex"], 1);
        assert_eq!(report.job_type_counts["full-time"], 1);

        let all = q.get_stats(None).unwrap();
        assert!(all.pairs.is_empty());
        assert_eq!(all.top_pairs.len(), 2);
        assert!(q.get_stats(Some("")).is_err());
        assert!(q.get_stats(Some("cobol")).unwrap().pairs.is_empty());
    }

    #[test]
    fn latest_listings() {
        let q = service();
        let latest: Vec<String> = q.latest(2).into_iter().map(|s| s.id).collect();
        assert_eq!(latest, vec!["b1", "a1"]);
        assert_eq!(q.listing_count(), 3);
    }
}
