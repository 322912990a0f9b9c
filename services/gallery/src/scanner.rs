//! Read-only views over the raw and processed stores.

use crate::photo::{is_group_tagged, is_servable_name, PhotoRecord};
use crate::sanitize::Segment;
use crate::store::{Partition, PhotoStore};
use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

/// Photos currently present in the event's raw upload directory.
///
/// A missing directory is an empty result, not an error.
pub async fn scan_raw(store: &PhotoStore, event_id: &Segment) -> io::Result<Vec<PhotoRecord>> {
    let names = list_servable_files(&store.raw_dir(event_id)).await?;

    debug!(event_id = %event_id, count = names.len(), "Scanned raw uploads");

    Ok(names
        .into_iter()
        .map(|name| PhotoRecord::raw(event_id.clone(), name))
        .collect())
}

/// Public group copies for the event across all person partitions.
///
/// Only `group/` partitions are walked and only tag-prefixed files kept;
/// individual copies never become records here. Person directories are
/// visited in sorted order so the output order is stable across calls.
pub async fn scan_processed(store: &PhotoStore, event_id: &Segment) -> io::Result<Vec<PhotoRecord>> {
    let event_dir = store.processed_event_dir(event_id);
    let mut records = Vec::new();

    for person in list_dirs(&event_dir).await? {
        let group_dir = event_dir.join(&person).join(Partition::Group.as_str());

        for name in list_servable_files(&group_dir).await? {
            if is_group_tagged(&name) {
                records.push(PhotoRecord::group(event_id.clone(), person.clone(), name));
            }
        }
    }

    debug!(event_id = %event_id, count = records.len(), "Scanned processed store");

    Ok(records)
}

/// Names of files held privately in any person's `individual/` partition.
///
/// Used only to keep the raw originals of private photos out of public
/// listings; the names themselves are never surfaced.
pub async fn private_names(store: &PhotoStore, event_id: &Segment) -> io::Result<BTreeSet<String>> {
    let event_dir = store.processed_event_dir(event_id);
    let mut names = BTreeSet::new();

    for person in list_dirs(&event_dir).await? {
        let individual_dir = event_dir.join(&person).join(Partition::Individual.as_str());
        names.extend(list_entries(&individual_dir, false).await?);
    }

    Ok(names)
}

/// Sorted subdirectory names; empty when `dir` does not exist
pub(crate) async fn list_dirs(dir: &Path) -> io::Result<Vec<String>> {
    list_entries(dir, true).await.map(|mut names| {
        names.retain(|name| !name.starts_with('.'));
        names
    })
}

/// Sorted names of files that can be listed and fetched back by name
async fn list_servable_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = list_entries(dir, false).await?;
    names.retain(|name| is_servable_name(name));
    Ok(names)
}

async fn list_entries(dir: &Path, want_dirs: bool) -> io::Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_type = match entry.file_type().await {
            Ok(file_type) => file_type,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        let matches = if want_dirs {
            file_type.is_dir()
        } else {
            file_type.is_file()
        };

        if matches {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }

    names.sort();
    Ok(names)
}
