//! Optional on-disk cache of the index, so restarts don't start cold.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::to_writer;

use crate::{
    index::{JobIndex, Tombstone, Upsert},
    listing::JobListing,
};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: u64,
    pub listings: Vec<JobListing>,
    #[serde(default)]
    pub tombstones: Vec<Tombstone>,
}

impl Snapshot {
    pub fn capture(index: &JobIndex, saved_at: u64) -> Self {
        let mut listings: Vec<JobListing> = index.listings().cloned().collect();
        listings.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            version: SNAPSHOT_VERSION,
            saved_at,
            listings,
            tombstones: index.tombstones(),
        }
    }

    /// Replay into `index` through the normal upsert path, so listings the
    /// index already holds at a newer revision are kept. Returns how many
    /// listings were taken.
    pub fn restore_into(self, index: &mut JobIndex) -> usize {
        for stone in self.tombstones {
            index.bury(stone);
        }
        self.listings
            .into_iter()
            .map(|listing| index.upsert(listing))
            .filter(|outcome| matches!(outcome, Upsert::Inserted | Upsert::Replaced { .. }))
            .count()
    }
}

/// Write the snapshot atomically next to `path`.
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)?;
    let tmp = tempfile::NamedTempFile::new_in(&parent)?;
    to_writer(&tmp, snapshot)?;
    tmp.persist(path)
        .with_context(|| format!("persist snapshot {}", path.display()))?;
    Ok(())
}

/// Read a snapshot. A missing file is not an error.
pub fn load(path: &Path) -> Result<Option<Snapshot>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read snapshot {}", path.display())),
    };
    let snapshot: Snapshot = serde_json::from_slice(&data)
        .with_context(|| format!("parse snapshot {}", path.display()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        bail!(
            "snapshot {} has version {}, expected {}",
            path.display(),
            snapshot.version,
            SNAPSHOT_VERSION
        );
    }
    Ok(Some(snapshot))
}
