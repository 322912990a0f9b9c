use crate::config::StorageConfig;
use crate::photo::{PhotoRecord, GROUP_TAG};
use crate::sanitize::{self, Segment};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Processed-store partition inside a person directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Single-face photos, private to the person
    Individual,
    /// Multi-face photos, tag-prefixed and public
    Group,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Individual => "individual",
            Partition::Group => "group",
        }
    }
}

/// On-disk photo store shared by the worker, scanners and serving layer
///
/// Layout:
/// ```text
/// uploads/<event_id>/<filename>
/// processed/<event_id>/<person_id>/individual/<filename>
/// processed/<event_id>/<person_id>/group/watermarked_<filename>
/// ```
#[derive(Debug, Clone)]
pub struct PhotoStore {
    uploads_dir: PathBuf,
    processed_dir: PathBuf,
}

impl PhotoStore {
    /// Create a store rooted at the configured directories
    pub fn new(config: &StorageConfig) -> Self {
        Self::from_roots(&config.uploads_dir, &config.processed_dir)
    }

    pub fn from_roots(uploads_dir: impl AsRef<Path>, processed_dir: impl AsRef<Path>) -> Self {
        Self {
            uploads_dir: uploads_dir.as_ref().to_path_buf(),
            processed_dir: processed_dir.as_ref().to_path_buf(),
        }
    }

    pub fn uploads_root(&self) -> &Path {
        &self.uploads_dir
    }

    pub fn processed_root(&self) -> &Path {
        &self.processed_dir
    }

    /// Raw upload directory for an event
    pub fn raw_dir(&self, event_id: &Segment) -> PathBuf {
        self.uploads_dir.join(event_id)
    }

    /// Processed directory for an event
    pub fn processed_event_dir(&self, event_id: &Segment) -> PathBuf {
        self.processed_dir.join(event_id)
    }

    /// Partition directory for one person of an event
    pub fn partition_dir(&self, event_id: &Segment, person_id: &Segment, partition: Partition) -> PathBuf {
        self.processed_event_dir(event_id)
            .join(person_id)
            .join(partition.as_str())
    }

    /// Copy a single-face photo into the person's individual partition
    #[instrument(skip_all, fields(event_id = %event_id, person_id = %person_id, filename = %filename))]
    pub async fn place_individual(
        &self,
        event_id: &Segment,
        person_id: &Segment,
        source: &Path,
        filename: &Segment,
    ) -> io::Result<PhotoRecord> {
        let dir = self.partition_dir(event_id, person_id, Partition::Individual);
        copy_atomic(source, &dir, filename.as_str()).await?;

        Ok(PhotoRecord::individual(
            event_id.clone(),
            person_id.to_string(),
            filename.to_string(),
        ))
    }

    /// Copy a multi-face photo, tag-prefixed, into the person's group partition
    #[instrument(skip_all, fields(event_id = %event_id, person_id = %person_id, filename = %filename))]
    pub async fn place_group(
        &self,
        event_id: &Segment,
        person_id: &Segment,
        source: &Path,
        filename: &Segment,
    ) -> io::Result<PhotoRecord> {
        let dir = self.partition_dir(event_id, person_id, Partition::Group);
        let tagged = format!("{GROUP_TAG}{filename}");
        copy_atomic(source, &dir, &tagged).await?;

        Ok(PhotoRecord::group(event_id.clone(), person_id.to_string(), tagged))
    }

    /// Event directories present in the raw upload store
    pub async fn list_events(&self) -> io::Result<Vec<Segment>> {
        let mut events = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.uploads_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            match sanitize::identifier(&name, "list_events") {
                Ok(event_id) if event_id.as_str() == name => events.push(event_id),
                _ => warn!(directory = %name, "Skipping upload directory with unsafe name"),
            }
        }

        events.sort();
        Ok(events)
    }
}

/// Copy `source` to `dest_dir/dest_name` so readers never see a partial file.
///
/// The bytes land in a hidden `.part` file in the destination directory first
/// and are renamed into place; rename within one directory is atomic.
pub async fn copy_atomic(source: &Path, dest_dir: &Path, dest_name: &str) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(dest_dir).await?;

    let dest = dest_dir.join(dest_name);
    let temp = dest_dir.join(format!(".{dest_name}.{}.part", Uuid::new_v4().simple()));

    if let Err(e) = tokio::fs::copy(source, &temp).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&temp, &dest).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }

    debug!(source = %source.display(), dest = %dest.display(), "Photo copied");
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo::{PhotoSource, Visibility};

    fn segment(value: &str) -> Segment {
        sanitize::identifier(value, "test").unwrap()
    }

    #[test]
    fn test_partition_layout() {
        let store = PhotoStore::from_roots("/srv/uploads", "/srv/processed");
        let path = store.partition_dir(&segment("E1"), &segment("person_0001"), Partition::Group);

        assert_eq!(path, PathBuf::from("/srv/processed/E1/person_0001/group"));
        assert_eq!(store.raw_dir(&segment("E1")), PathBuf::from("/srv/uploads/E1"));
    }

    #[tokio::test]
    async fn test_place_group_tags_and_copies() {
        let dir = tempfile::tempdir().unwrap();
        let store = PhotoStore::from_roots(dir.path().join("uploads"), dir.path().join("processed"));
        let source = dir.path().join("C.jpg");
        std::fs::write(&source, b"group-bytes").unwrap();

        let record = store
            .place_group(&segment("E1"), &segment("P2"), &source, &segment("C.jpg"))
            .await
            .unwrap();

        let copied = dir.path().join("processed/E1/P2/group/watermarked_C.jpg");
        assert_eq!(std::fs::read(copied).unwrap(), b"group-bytes");
        assert_eq!(record.filename, "watermarked_C.jpg");
        assert_eq!(record.base_name, "C.jpg");
        assert_eq!(record.source, PhotoSource::Processed);
        assert_eq!(record.visibility, Visibility::Public);
    }

    #[tokio::test]
    async fn test_place_individual_is_private() {
        let dir = tempfile::tempdir().unwrap();
        let store = PhotoStore::from_roots(dir.path().join("uploads"), dir.path().join("processed"));
        let source = dir.path().join("B.jpg");
        std::fs::write(&source, b"solo").unwrap();

        let record = store
            .place_individual(&segment("E1"), &segment("P1"), &source, &segment("B.jpg"))
            .await
            .unwrap();

        assert!(dir.path().join("processed/E1/P1/individual/B.jpg").exists());
        assert_eq!(record.visibility, Visibility::PrivateToPerson);
    }

    #[tokio::test]
    async fn test_copy_atomic_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.png");
        std::fs::write(&source, b"png").unwrap();
        let dest_dir = dir.path().join("out");

        copy_atomic(&source, &dest_dir, "a.png").await.unwrap();
        // Re-running overwrites in place
        copy_atomic(&source, &dest_dir, "a.png").await.unwrap();

        let names: Vec<_> = std::fs::read_dir(&dest_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["a.png".to_string()]);
    }

    #[tokio::test]
    async fn test_copy_atomic_missing_source_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let dest_dir = dir.path().join("out");

        let result = copy_atomic(&dir.path().join("missing.jpg"), &dest_dir, "x.jpg").await;

        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(&dest_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_list_events_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PhotoStore::from_roots(dir.path().join("nope"), dir.path().join("processed"));

        assert!(store.list_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_events_sorted_dirs_only() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(uploads.join("E2")).unwrap();
        std::fs::create_dir_all(uploads.join("E1")).unwrap();
        std::fs::write(uploads.join("stray.jpg"), b"x").unwrap();
        let store = PhotoStore::from_roots(&uploads, dir.path().join("processed"));

        let events: Vec<String> = store
            .list_events()
            .await
            .unwrap()
            .into_iter()
            .map(Segment::into_string)
            .collect();

        assert_eq!(events, vec!["E1".to_string(), "E2".to_string()]);
    }
}
