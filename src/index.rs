//! In-memory job index with replace-by-revision semantics.
//!
//! The index holds exactly one listing per `(author, slot)`. Incoming
//! revisions are resolved by [`merge`], which depends only on the two
//! listings involved, so the final state does not depend on delivery order.

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet, VecDeque},
};

use serde::{Deserialize, Serialize};

use crate::{
    listing::{normalize_skill, JobListing, SlotKey},
    parser::Retraction,
    stats::SkillStats,
};

/// Resolution of an incoming listing against the current one for its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// No current listing; take the incoming one.
    Insert,
    /// Incoming supersedes current.
    Replace,
    /// Current stays; incoming is stale or a re-delivery.
    Keep,
}

/// Decide between the current listing of a slot and an incoming one.
///
/// Higher revision wins. Equal revisions fall back to the lower event id so
/// that two conflicting events settle the same way in either order.
pub fn merge(current: Option<&JobListing>, incoming: &JobListing) -> Merge {
    let Some(current) = current else {
        return Merge::Insert;
    };
    match incoming.revision.cmp(&current.revision) {
        Ordering::Greater => Merge::Replace,
        Ordering::Less => Merge::Keep,
        Ordering::Equal if incoming.id < current.id => Merge::Replace,
        Ordering::Equal => Merge::Keep,
    }
}

/// Result of [`JobIndex::upsert`].
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    Inserted,
    Replaced { previous_id: String },
    /// Stale revision or identical re-delivery.
    Unchanged,
    /// Suppressed by an earlier retraction.
    Retracted,
    /// The id already names a listing in a different slot.
    IdConflict,
}

/// Normalized skill token to the ids of listings requiring it.
#[derive(Debug, Default)]
pub struct SkillIndex {
    by_skill: HashMap<String, HashSet<String>>,
}

impl SkillIndex {
    fn insert(&mut self, listing: &JobListing) {
        for skill in &listing.skills {
            self.by_skill
                .entry(skill.clone())
                .or_default()
                .insert(listing.id.clone());
        }
    }

    fn remove(&mut self, listing: &JobListing) {
        for skill in &listing.skills {
            if let Some(ids) = self.by_skill.get_mut(skill) {
                ids.remove(&listing.id);
                if ids.is_empty() {
                    self.by_skill.remove(skill);
                }
            }
        }
    }

    pub fn ids(&self, skill: &str) -> Option<&HashSet<String>> {
        self.by_skill.get(skill)
    }
}

/// A remembered retraction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Tombstone {
    /// Every revision of the slot up to `at` is deleted.
    Slot { author: String, slot: String, at: u64 },
    /// One specific event is deleted.
    Event { author: String, id: String },
}

/// Bounded FIFO of retractions, consulted before accepting a listing.
#[derive(Debug)]
struct Tombstones {
    slots: HashMap<SlotKey, u64>,
    events: HashMap<String, String>,
    order: VecDeque<Tombstone>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            events: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn bury(&mut self, stone: Tombstone) {
        if self.capacity == 0 {
            return;
        }
        match &stone {
            Tombstone::Slot { author, slot, at } => {
                let key = SlotKey::new(author.clone(), slot.clone());
                match self.slots.get_mut(&key) {
                    Some(existing) => {
                        *existing = (*existing).max(*at);
                        return;
                    }
                    None => {
                        self.slots.insert(key, *at);
                    }
                }
            }
            Tombstone::Event { author, id } => {
                if self.events.insert(id.clone(), author.clone()).is_some() {
                    return;
                }
            }
        }
        self.order.push_back(stone);
        while self.order.len() > self.capacity {
            match self.order.pop_front() {
                Some(Tombstone::Slot { author, slot, .. }) => {
                    self.slots.remove(&SlotKey::new(author, slot));
                }
                Some(Tombstone::Event { id, .. }) => {
                    self.events.remove(&id);
                }
                None => break,
            }
        }
    }

    /// The listing's own event was deleted by its author.
    fn deletes_event(&self, listing: &JobListing) -> bool {
        self.events
            .get(&listing.id)
            .is_some_and(|author| *author == listing.author)
    }

    fn covers_slot(&self, listing: &JobListing) -> bool {
        self.slots
            .get(&listing.slot_key())
            .is_some_and(|at| listing.revision <= *at)
    }

    fn export(&self) -> Vec<Tombstone> {
        self.order
            .iter()
            .map(|stone| match stone {
                Tombstone::Slot { author, slot, .. } => {
                    let key = SlotKey::new(author.clone(), slot.clone());
                    Tombstone::Slot {
                        author: author.clone(),
                        slot: slot.clone(),
                        at: self.slots.get(&key).copied().unwrap_or_default(),
                    }
                }
                other => other.clone(),
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Authoritative store of current listings.
#[derive(Debug)]
pub struct JobIndex {
    listings: HashMap<String, JobListing>,
    slots: HashMap<SlotKey, String>,
    skills: SkillIndex,
    tombstones: Tombstones,
}

impl Default for JobIndex {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl JobIndex {
    /// Create an empty index remembering at most `max_tombstones` retractions.
    pub fn new(max_tombstones: usize) -> Self {
        Self {
            listings: HashMap::new(),
            slots: HashMap::new(),
            skills: SkillIndex::default(),
            tombstones: Tombstones::new(max_tombstones),
        }
    }

    /// Insert or replace the listing for its slot.
    pub fn upsert(&mut self, listing: JobListing) -> Upsert {
        if self.tombstones.deletes_event(&listing) {
            // A deleted revision also retires every older revision of its slot.
            self.retire(&listing.author, &listing.slot, listing.revision);
            return Upsert::Retracted;
        }
        if self.tombstones.covers_slot(&listing) {
            return Upsert::Retracted;
        }
        let key = listing.slot_key();
        if let Some(owner) = self.listings.get(&listing.id) {
            if owner.slot_key() != key {
                return Upsert::IdConflict;
            }
        }
        let current = self.slots.get(&key).and_then(|id| self.listings.get(id));
        match merge(current, &listing) {
            Merge::Keep => Upsert::Unchanged,
            Merge::Insert => {
                self.attach(listing);
                Upsert::Inserted
            }
            Merge::Replace => {
                let previous_id = self
                    .detach(&key)
                    .map(|old| old.id)
                    .unwrap_or_default();
                self.attach(listing);
                Upsert::Replaced { previous_id }
            }
        }
    }

    /// Drop the current listing of a slot.
    pub fn remove(&mut self, author: &str, slot: &str) -> Option<JobListing> {
        self.detach(&SlotKey::new(author, slot))
    }

    /// Apply a deletion request, remembering it for late-arriving listings.
    pub fn retract(&mut self, retraction: &Retraction) -> Vec<JobListing> {
        let mut removed = vec![];
        for slot in &retraction.slots {
            removed.extend(self.retire(&retraction.author, slot, retraction.at));
        }
        for id in &retraction.event_ids {
            self.tombstones.bury(Tombstone::Event {
                author: retraction.author.clone(),
                id: id.clone(),
            });
            let target = self
                .listings
                .get(id)
                .filter(|l| l.author == retraction.author)
                .map(|l| (l.slot.clone(), l.revision));
            if let Some((slot, revision)) = target {
                removed.extend(self.retire(&retraction.author, &slot, revision));
            }
        }
        removed
    }

    /// Delete every revision of a slot up to `at`, including ones that arrive
    /// later. Returns the current listing if it was among them.
    fn retire(&mut self, author: &str, slot: &str, at: u64) -> Option<JobListing> {
        self.tombstones.bury(Tombstone::Slot {
            author: author.to_string(),
            slot: slot.to_string(),
            at,
        });
        let covered = self
            .slots
            .get(&SlotKey::new(author, slot))
            .and_then(|id| self.listings.get(id))
            .is_some_and(|l| l.revision <= at);
        if covered {
            self.remove(author, slot)
        } else {
            None
        }
    }

    /// Remove every listing whose revision is older than `cutoff`.
    pub fn evict_older_than(&mut self, cutoff: u64) -> usize {
        let stale: Vec<SlotKey> = self
            .listings
            .values()
            .filter(|l| l.revision < cutoff)
            .map(JobListing::slot_key)
            .collect();
        stale.iter().filter_map(|key| self.detach(key)).count()
    }

    pub fn get(&self, id: &str) -> Option<&JobListing> {
        self.listings.get(id)
    }

    /// The listing published under a job id (slot), newest first when several
    /// authors share it.
    pub fn find_by_slot(&self, slot: &str) -> Option<&JobListing> {
        self.slots
            .iter()
            .filter(|(key, _)| key.slot == slot)
            .filter_map(|(_, id)| self.listings.get(id))
            .min_by(|a, b| b.revision.cmp(&a.revision).then_with(|| a.id.cmp(&b.id)))
    }

    /// Listings requiring `skill`, newest revision first.
    pub fn search(&self, skill: &str) -> Vec<&JobListing> {
        let Some(skill) = normalize_skill(skill) else {
            return vec![];
        };
        let mut found: Vec<&JobListing> = self
            .skills
            .ids(&skill)
            .into_iter()
            .flatten()
            .filter_map(|id| self.listings.get(id))
            .collect();
        sort_recent_first(&mut found);
        found
    }

    /// The `limit` most recent listings.
    pub fn latest(&self, limit: usize) -> Vec<&JobListing> {
        let mut all: Vec<&JobListing> = self.listings.values().collect();
        sort_recent_first(&mut all);
        all.truncate(limit);
        all
    }

    /// Aggregate statistics over the current listings.
    pub fn stats(&self) -> SkillStats {
        SkillStats::compute(self.listings.values())
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn listings(&self) -> impl Iterator<Item = &JobListing> {
        self.listings.values()
    }

    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.tombstones.export()
    }

    /// Re-apply remembered retractions, e.g. after loading a snapshot.
    pub fn bury(&mut self, stone: Tombstone) {
        self.tombstones.bury(stone);
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    fn attach(&mut self, listing: JobListing) {
        self.skills.insert(&listing);
        self.slots.insert(listing.slot_key(), listing.id.clone());
        self.listings.insert(listing.id.clone(), listing);
    }

    fn detach(&mut self, key: &SlotKey) -> Option<JobListing> {
        let id = self.slots.remove(key)?;
        let listing = self.listings.remove(&id)?;
        self.skills.remove(&listing);
        Some(listing)
    }
}

fn sort_recent_first(listings: &mut [&JobListing]) {
    listings.sort_by(|a, b| b.revision.cmp(&a.revision).then_with(|| a.id.cmp(&b.id)));
}
