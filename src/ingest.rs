//! The merge task: the only place the index is mutated.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::{
    sync::watch,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, trace};

use crate::{
    error::Error,
    event::Event,
    index::{JobIndex, Upsert},
    parser::{ListingParser, Parsed, Rejection},
    pool::{PoolItem, PoolStream},
    shared::IndexWriter,
    snapshot::{self, Snapshot},
};

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Running counters, readable from any task.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    duplicates: AtomicU64,
    ignored: AtomicU64,
    rejected: AtomicU64,
    inserted: AtomicU64,
    replaced: AtomicU64,
    stale: AtomicU64,
    suppressed: AtomicU64,
    retracted: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestCounts {
    pub received: u64,
    pub duplicates: u64,
    pub ignored: u64,
    pub rejected: u64,
    pub inserted: u64,
    pub replaced: u64,
    pub stale: u64,
    pub suppressed: u64,
    pub retracted: u64,
    pub evicted: u64,
}

impl IngestStats {
    pub fn counts(&self) -> IngestCounts {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        IngestCounts {
            received: get(&self.received),
            duplicates: get(&self.duplicates),
            ignored: get(&self.ignored),
            rejected: get(&self.rejected),
            inserted: get(&self.inserted),
            replaced: get(&self.replaced),
            stale: get(&self.stale),
            suppressed: get(&self.suppressed),
            retracted: get(&self.retracted),
            evicted: get(&self.evicted),
        }
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// What applying one event did to the index.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Upserted(Upsert),
    Retracted(usize),
    /// Already older than the eviction horizon.
    Expired,
    Ignored,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Listings older than this are evicted. `None` keeps them forever.
    pub ttl: Option<Duration>,
    pub evict_interval: Duration,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            ttl: None,
            evict_interval: Duration::from_secs(60),
            snapshot_path: None,
            snapshot_interval: Duration::from_secs(300),
        }
    }
}

pub struct Ingestor {
    parser: ListingParser,
    writer: IndexWriter,
    stats: Arc<IngestStats>,
    settings: IngestSettings,
}

impl Ingestor {
    pub fn new(parser: ListingParser, writer: IndexWriter, settings: IngestSettings) -> Self {
        Self {
            parser,
            writer,
            stats: Arc::new(IngestStats::default()),
            settings,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Oldest revision kept at `now`, when a TTL is configured.
    fn cutoff(&self, now: u64) -> Option<u64> {
        self.settings
            .ttl
            .map(|ttl| now.saturating_sub(ttl.as_secs()))
    }

    /// Parse one event and merge it into the index.
    pub fn apply_event(&self, event: &Event) -> Applied {
        let stats = &self.stats;
        bump(&stats.received, 1);
        match self.parser.classify(event) {
            Err(Rejection::NotAJobListing { kind }) => {
                trace!(id = %event.id, kind, "ignoring event");
                bump(&stats.ignored, 1);
                Applied::Ignored
            }
            Err(rejection) => {
                let error = Error::from(rejection);
                debug!(id = %event.id, %error, "rejecting listing");
                bump(&stats.rejected, 1);
                Applied::Rejected
            }
            Ok(Parsed::Listing(listing))
                if self
                    .cutoff(unix_now())
                    .is_some_and(|cutoff| listing.revision < cutoff) =>
            {
                trace!(id = %event.id, revision = listing.revision, "dropping expired listing");
                bump(&stats.stale, 1);
                Applied::Expired
            }
            Ok(Parsed::Listing(listing)) => {
                let outcome = self.writer.write(|index| index.upsert(listing));
                let counter = match &outcome {
                    Upsert::Inserted => &stats.inserted,
                    Upsert::Replaced { .. } => &stats.replaced,
                    Upsert::Unchanged => &stats.stale,
                    Upsert::Retracted => &stats.suppressed,
                    Upsert::IdConflict => &stats.rejected,
                };
                bump(counter, 1);
                trace!(id = %event.id, ?outcome, "listing merged");
                Applied::Upserted(outcome)
            }
            Ok(Parsed::Retraction(retraction)) => {
                let removed = self.writer.write(|index| index.retract(&retraction));
                bump(&stats.retracted, removed.len() as u64);
                debug!(author = %retraction.author, removed = removed.len(), "applied deletion");
                Applied::Retracted(removed.len())
            }
        }
    }

    /// Drop listings older than the configured horizon.
    pub fn evict_expired(&self, now: u64) -> usize {
        let Some(cutoff) = self.cutoff(now) else {
            return 0;
        };
        let evicted = self.writer.write(|index| index.evict_older_than(cutoff));
        if evicted > 0 {
            info!(evicted, cutoff, "evicted expired listings");
        }
        bump(&self.stats.evicted, evicted as u64);
        evicted
    }

    /// Load the configured snapshot, if any, into the index.
    pub fn restore_snapshot(&self) -> anyhow::Result<usize> {
        let Some(path) = &self.settings.snapshot_path else {
            return Ok(0);
        };
        let Some(snapshot) = snapshot::load(path)? else {
            return Ok(0);
        };
        let (restored, tombstones) = self.writer.write(|index| {
            let restored = snapshot.restore_into(index);
            (restored, index.tombstone_count())
        });
        info!(restored, tombstones, path = %path.display(), "restored snapshot");
        Ok(restored)
    }

    fn save_snapshot(&self) {
        let Some(path) = &self.settings.snapshot_path else {
            return;
        };
        let snapshot = self
            .writer
            .reader()
            .read(|index: &JobIndex| Snapshot::capture(index, unix_now()));
        match snapshot::save(path, &snapshot) {
            Ok(()) => debug!(listings = snapshot.listings.len(), "snapshot saved"),
            Err(e) => error!(error = %e, path = %path.display(), "snapshot failed"),
        }
    }

    /// Consume the pool until it ends. `ready` flips to true once the pool has
    /// caught up.
    pub async fn run(self, mut stream: PoolStream, ready: watch::Sender<bool>) {
        let mut evict = interval_at(
            Instant::now() + self.settings.evict_interval,
            self.settings.evict_interval,
        );
        evict.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut save = interval_at(
            Instant::now() + self.settings.snapshot_interval,
            self.settings.snapshot_interval,
        );
        save.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let evicting = self.settings.ttl.is_some();
        let saving = self.settings.snapshot_path.is_some();

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(PoolItem::Event { relay, event }) => {
                        trace!(%relay, id = %event.id, "event");
                        self.apply_event(&event);
                        self.stats.duplicates.store(stream.duplicates(), Ordering::Relaxed);
                    }
                    Some(PoolItem::CaughtUp) => {
                        self.stats.duplicates.store(stream.duplicates(), Ordering::Relaxed);
                        let listings = self.writer.reader().read(JobIndex::len);
                        info!(listings, "index caught up with relays");
                        ready.send_replace(true);
                    }
                    None => break,
                },
                _ = evict.tick(), if evicting => {
                    self.evict_expired(unix_now());
                }
                _ = save.tick(), if saving => self.save_snapshot(),
            }
        }
        self.save_snapshot();
        info!("ingest stopped");
    }
}
