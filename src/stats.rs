//! Aggregate statistics over current listings.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::listing::JobListing;

/// How often two skills are required together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillPair {
    pub skills: [String; 2],
    pub count: usize,
}

/// A skill co-occurring with a queried one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairCount {
    pub skill: String,
    pub count: usize,
}

/// Counts computed from one consistent view of the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkillStats {
    pub total_listings: usize,
    pub skill_counts: BTreeMap<String, usize>,
    /// Unordered pairs of distinct skills, stored with the smaller skill first.
    pub pair_counts: BTreeMap<(String, String), usize>,
    pub company_counts: BTreeMap<String, usize>,
    pub job_type_counts: BTreeMap<String, usize>,
}

impl SkillStats {
    pub fn compute<'a>(listings: impl IntoIterator<Item = &'a JobListing>) -> Self {
        let mut stats = SkillStats::default();
        for listing in listings {
            stats.total_listings += 1;
            let skills: Vec<&String> = listing.skills.iter().collect();
            for (i, a) in skills.iter().enumerate() {
                *stats.skill_counts.entry((*a).clone()).or_default() += 1;
                // skills is an ordered set, so every later entry sorts after `a`
                for b in &skills[i + 1..] {
                    *stats
                        .pair_counts
                        .entry(((*a).clone(), (*b).clone()))
                        .or_default() += 1;
                }
            }
            if let Some(company) = &listing.company {
                *stats.company_counts.entry(company.clone()).or_default() += 1;
            }
            if let Some(job_type) = &listing.job_type {
                *stats.job_type_counts.entry(job_type.clone()).or_default() += 1;
            }
        }
        stats
    }

    /// Skills co-occurring with `skill`, most frequent first, ties by name.
    pub fn pairs_with(&self, skill: &str) -> Vec<PairCount> {
        let mut pairs: Vec<PairCount> = self
            .pair_counts
            .iter()
            .filter_map(|((a, b), count)| {
                let other = if a == skill {
                    b
                } else if b == skill {
                    a
                } else {
                    return None;
                };
                Some(PairCount {
                    skill: other.clone(),
                    count: *count,
                })
            })
            .collect();
        pairs.sort_by(|x, y| y.count.cmp(&x.count).then_with(|| x.skill.cmp(&y.skill)));
        pairs
    }

    /// The `limit` most frequent pairs overall.
    pub fn top_pairs(&self, limit: usize) -> Vec<SkillPair> {
        let mut pairs: Vec<SkillPair> = self
            .pair_counts
            .iter()
            .map(|((a, b), count)| SkillPair {
                skills: [a.clone(), b.clone()],
                count: *count,
            })
            .collect();
        pairs.sort_by(|x, y| y.count.cmp(&x.count).then_with(|| x.skills.cmp(&y.skills)));
        pairs.truncate(limit);
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::listing;

    fn sample() -> Vec<JobListing> {
        let mut a = listing("a", "k1", "s1", 1, &["rust", "python"]);
        a.company = Some("Acme".into());
        a.job_type = Some("full-time".into());
        let mut b = listing("b", "k1", "s2", 2, &["rust", "go"]);
        b.company = Some("Acme".into());
        let c = listing("c", "k2", "s1", 3, &["rust", "python", "sql"]);
        let d = listing("d", "k3", "s1", 4, &["rust"]);
        vec![a, b, c, d]
    }

    #[test]
    fn counts() {
        let listings = sample();
        let stats = SkillStats::compute(&listings);
        assert_eq!(stats.total_listings, 4);
        assert_eq!(stats.skill_counts["rust"], 4);
        assert_eq!(stats.skill_counts["python"], 2);
        assert_eq!(stats.pair_counts[&("python".into(), "rust".into())], 2);
        assert_eq!(stats.company_counts["Acme"], 2);
        assert_eq!(stats.job_type_counts["full-time"], 1);
        assert_eq!(stats.skill_counts.len(), 4);
    }

    #[test]
    fn pairs_with_sorted_by_count_then_name() {
        let stats = SkillStats::compute(&sample());
        let pairs = stats.pairs_with("rust");
        let got: Vec<(&str, usize)> = pairs.iter().map(|p| (p.skill.as_str(), p.count)).collect();
        assert_eq!(got, vec![("python", 2), ("go", 1), ("sql", 1)]);
        assert!(stats.pairs_with("cobol").is_empty());
    }

    #[test]
    fn pair_sum_matches_co_skill_total() {
        let listings = sample();
        let stats = SkillStats::compute(&listings);
        for skill in ["rust", "python", "go", "sql"] {
            let sum: usize = stats.pairs_with(skill).iter().map(|p| p.count).sum();
            let expected: usize = listings
                .iter()
                .filter(|l| l.skills.contains(skill))
                .map(|l| l.skills.len() - 1)
                .sum();
            assert_eq!(sum, expected, "{skill}");
        }
    }

    #[test]
    fn top_pairs_limited() {
        let stats = SkillStats::compute(&sample());
        let top = stats.top_pairs(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].skills, ["python".to_string(), "rust".to_string()]);
        assert_eq!(top[0].count, 2);
    }

    #[test]
    fn empty() {
        let stats = SkillStats::compute(std::iter::empty());
        assert_eq!(stats, SkillStats::default());
    }
}
