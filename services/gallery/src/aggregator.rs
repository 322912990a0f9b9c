//! Merges the raw and processed views of an event into one public listing.

use crate::photo::PhotoRecord;
use crate::sanitize::Segment;
use crate::scanner;
use crate::store::PhotoStore;
use std::collections::HashSet;
use std::io;
use tracing::{debug, info, instrument};

/// Deduplicated, ordered public listing for one event.
///
/// A processed group copy dominates its raw original, and copies of the same
/// photo held by several people collapse to the first one seen. Raw originals
/// of photos that were filed privately are withheld. Records are sorted by
/// base name, then filename.
#[instrument(skip_all, fields(event_id = %event_id))]
pub async fn aggregate(store: &PhotoStore, event_id: &Segment) -> io::Result<Vec<PhotoRecord>> {
    let processed = scanner::scan_processed(store, event_id).await?;
    let raw = scanner::scan_raw(store, event_id).await?;
    let private = scanner::private_names(store, event_id).await?;

    let scanned_processed = processed.len();
    let scanned_raw = raw.len();

    let mut seen = HashSet::new();
    let mut photos: Vec<PhotoRecord> = processed
        .into_iter()
        .filter(|record| seen.insert(record.base_name.clone()))
        .collect();

    photos.extend(
        raw.into_iter()
            .filter(|record| !seen.contains(&record.base_name) && !private.contains(&record.base_name)),
    );

    photos.sort_by(|a, b| {
        a.base_name
            .cmp(&b.base_name)
            .then_with(|| a.filename.cmp(&b.filename))
    });

    debug!(
        processed = scanned_processed,
        raw = scanned_raw,
        private = private.len(),
        "Scanned event stores"
    );
    info!(
        photos = photos.len(),
        duplicates_removed = scanned_processed + scanned_raw - photos.len(),
        "Aggregated event photos"
    );

    Ok(photos)
}
