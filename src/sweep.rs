//! Finds files under the downloads root that no ringtone row points at.
//!
//! Creates and deletes touch the database and the filesystem without a shared
//! transaction, so a crash in between can leave a file behind. This walks the
//! tree and reports (or removes) those leftovers.
//!
//! A build writes its files before it inserts the row, so files younger than
//! the caller's `min_age` are left alone.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::{ringtones::is_partial_name, store::RingtoneStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    pub path: PathBuf,
    /// Left behind by a build that never finished (`.part-<uuid>` names).
    pub partial: bool,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub orphans: Vec<Orphan>,
    /// Unreferenced files skipped because they are younger than `min_age`.
    pub recent: usize,
    pub removed: usize,
}

/// Walks `downloads_root/<user>/<file>` and classifies every file against
/// the download URLs known to the store.
pub async fn find_orphans(
    store: &RingtoneStore,
    downloads_root: &Path,
    min_age: Duration,
) -> Result<SweepReport> {
    let known = store
        .all_download_urls()
        .await
        .context("loading known download URLs")?;
    Ok(classify(downloads_root, &known, min_age))
}

fn classify(downloads_root: &Path, known: &HashSet<String>, min_age: Duration) -> SweepReport {
    let mut report = SweepReport::default();
    if !downloads_root.exists() {
        return report;
    }

    for entry in WalkDir::new(downloads_root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        report.scanned += 1;
        let referenced =
            public_url(downloads_root, entry.path()).is_some_and(|url| known.contains(&url));
        if referenced {
            continue;
        }
        if is_recent(&entry, min_age) {
            debug!(path = %entry.path().display(), "skipping recent file");
            report.recent += 1;
            continue;
        }
        let partial = is_partial_name(&entry.file_name().to_string_lossy());
        debug!(path = %entry.path().display(), partial, "orphaned file");
        report.orphans.push(Orphan {
            path: entry.path().to_path_buf(),
            partial,
        });
    }
    report
}

/// Files whose age cannot be read count as recent.
fn is_recent(entry: &DirEntry, min_age: Duration) -> bool {
    match entry.metadata().ok().and_then(|meta| meta.modified().ok()) {
        Some(modified) => modified.elapsed().unwrap_or_default() < min_age,
        None => !min_age.is_zero(),
    }
}

/// `/downloads/<user>/<file>` for files exactly two levels below the root.
fn public_url(downloads_root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(downloads_root).ok()?;
    let mut parts = relative.iter().map(|part| part.to_str());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Some(user_id)), Some(Some(file_name)), None) => {
            Some(format!("/downloads/{user_id}/{file_name}"))
        }
        _ => None,
    }
}

/// Deletes every orphan in `report`, logging the ones that cannot be removed.
pub async fn remove_orphans(report: &mut SweepReport) {
    for orphan in &report.orphans {
        match tokio::fs::remove_file(&orphan.path).await {
            Ok(()) => {
                report.removed += 1;
                info!(path = %orphan.path.display(), "removed orphaned file");
            }
            Err(err) => warn!(path = %orphan.path.display(), error = %err, "could not remove orphaned file"),
        }
    }
}
