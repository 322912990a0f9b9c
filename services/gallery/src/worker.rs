//! Background processing of raw uploads into the identity-partitioned store.
//!
//! A run walks every image present in an event's raw directory when it starts,
//! resolves faces, and copies each file into the person partitions it belongs
//! to. Failures are contained at the file boundary: a corrupt image or a
//! detector error is recorded in the run summary and the loop moves on.

use crate::face::{FaceError, FaceResolver, LoadedImage};
use crate::photo::{is_allowed_image, is_non_photo_artifact};
use crate::sanitize::{self, Segment};
use crate::store::PhotoStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Per-file processing failure
#[derive(Debug, Error)]
pub enum FileError {
    #[error("Failed to load image: {0}")]
    Load(String),

    #[error("Face detection failed: {0}")]
    Detection(#[from] FaceError),

    #[error("Failed to store processed copy: {0}")]
    Store(#[from] io::Error),
}

impl FileError {
    pub fn kind(&self) -> FileErrorKind {
        match self {
            FileError::Load(_) => FileErrorKind::LoadError,
            FileError::Detection(_) => FileErrorKind::DetectionError,
            FileError::Store(_) => FileErrorKind::StoreError,
        }
    }
}

/// Kind of per-file failure recorded in a run summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileErrorKind {
    LoadError,
    DetectionError,
    StoreError,
    /// Name would not survive sanitization, so it cannot be stored or served
    InvalidFilename,
}

/// Why a file produced no processed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoFaces,
}

/// Outcome of processing one raw file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum FileOutcome {
    Succeeded {
        face_count: usize,
        person_ids: BTreeSet<String>,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        kind: FileErrorKind,
    },
}

/// One file's entry in a run summary
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub filename: String,
    pub outcome: FileOutcome,
}

/// Run-level failure before any file was attempted
#[derive(Debug, Clone, Error, Serialize)]
pub enum RunError {
    #[error("Invalid event identifier")]
    InvalidEvent,

    #[error("Raw upload directory missing")]
    RawDirectoryMissing,

    #[error("Failed to list raw upload directory: {0}")]
    ListFailed(String),
}

/// Summary of one processing run over one event's backlog
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingRun {
    pub event_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<FileReport>,
    /// Set when the run aborted before processing any file
    pub aborted: Option<RunError>,
}

impl ProcessingRun {
    fn start(event_id: &str) -> Self {
        let now = Utc::now();
        Self {
            event_id: event_id.to_string(),
            started_at: now,
            finished_at: now,
            files: Vec::new(),
            aborted: None,
        }
    }

    fn abort(mut self, reason: RunError) -> Self {
        self.aborted = Some(reason);
        self.finished_at = Utc::now();
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Succeeded { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Failed { .. }))
    }

    pub fn total_faces(&self) -> usize {
        self.files
            .iter()
            .map(|f| match &f.outcome {
                FileOutcome::Succeeded { face_count, .. } => *face_count,
                _ => 0,
            })
            .sum()
    }

    /// Outcome recorded for a file, if it was part of the run
    pub fn outcome(&self, filename: &str) -> Option<&FileOutcome> {
        self.files
            .iter()
            .find(|f| f.filename == filename)
            .map(|f| &f.outcome)
    }

    fn count(&self, predicate: impl Fn(&FileOutcome) -> bool) -> usize {
        self.files.iter().filter(|f| predicate(&f.outcome)).count()
    }
}

/// Turns raw uploads into processed person partitions
pub struct ProcessingWorker {
    store: PhotoStore,
    resolver: Arc<dyn FaceResolver>,
}

impl ProcessingWorker {
    pub fn new(store: PhotoStore, resolver: Arc<dyn FaceResolver>) -> Self {
        Self { store, resolver }
    }

    /// Process every image currently in the event's raw directory
    #[instrument(skip(self))]
    pub async fn process_event(&self, event_id: &str) -> ProcessingRun {
        let mut run = ProcessingRun::start(event_id);
        let timer = Instant::now();

        let event = match sanitize::identifier(event_id, "process_event") {
            Ok(event) => event,
            Err(_) => {
                error!(event_id = %event_id, operation = "process_event", "Processing run aborted: invalid event id");
                metrics::counter!("gallery.runs.aborted").increment(1);
                return run.abort(RunError::InvalidEvent);
            }
        };

        let raw_dir = self.store.raw_dir(&event);
        let batch = match list_batch(&raw_dir).await {
            Ok(batch) => batch,
            Err(reason) => {
                error!(
                    event_id = %event,
                    path = %raw_dir.display(),
                    error = %reason,
                    operation = "process_event",
                    "Processing run aborted"
                );
                metrics::counter!("gallery.runs.aborted").increment(1);
                return run.abort(reason);
            }
        };

        info!(
            event_id = %event,
            files = batch.len(),
            operation = "process_event",
            "Starting processing run"
        );

        for entry in batch {
            let report = match entry {
                BatchEntry::Photo(filename) => FileReport {
                    outcome: self.process_one(&event, &raw_dir, &filename).await,
                    filename: filename.into_string(),
                },
                BatchEntry::UnsafeName(filename) => {
                    error!(
                        event_id = %event,
                        filename = %filename.escape_debug(),
                        operation = "process_event",
                        "Upload has an unsafe filename and cannot be processed"
                    );
                    metrics::counter!("gallery.files.failed").increment(1);
                    FileReport {
                        filename,
                        outcome: FileOutcome::Failed {
                            kind: FileErrorKind::InvalidFilename,
                        },
                    }
                }
            };
            run.files.push(report);
        }

        run.finished_at = Utc::now();
        metrics::histogram!("gallery.run.duration_seconds").record(timer.elapsed().as_secs_f64());

        info!(
            event_id = %event,
            photos_processed = run.succeeded(),
            photos_skipped = run.skipped(),
            photos_failed = run.failed(),
            total_faces_detected = run.total_faces(),
            operation = "process_event",
            "Processing run complete"
        );

        run
    }

    /// Process one file, containing any failure to this file
    async fn process_one(&self, event: &Segment, raw_dir: &Path, filename: &Segment) -> FileOutcome {
        let source = raw_dir.join(filename);

        match self.process_file(event, &source, filename).await {
            Ok(outcome) => {
                match &outcome {
                    FileOutcome::Skipped { .. } => {
                        warn!(
                            event_id = %event,
                            filename = %filename,
                            operation = "process_event",
                            "No faces detected in photo"
                        );
                        metrics::counter!("gallery.files.skipped").increment(1);
                    }
                    _ => metrics::counter!("gallery.files.processed").increment(1),
                }
                outcome
            }
            Err(e) => {
                let operation = match e.kind() {
                    FileErrorKind::LoadError => "load_image",
                    FileErrorKind::DetectionError => "face_detection",
                    FileErrorKind::StoreError => "file_copy",
                    FileErrorKind::InvalidFilename => "process_event",
                };
                error!(
                    event_id = %event,
                    filename = %filename,
                    error = %e,
                    operation = operation,
                    "Failed to process photo"
                );
                metrics::counter!("gallery.files.failed").increment(1);
                FileOutcome::Failed { kind: e.kind() }
            }
        }
    }

    async fn process_file(
        &self,
        event: &Segment,
        source: &Path,
        filename: &Segment,
    ) -> Result<FileOutcome, FileError> {
        let image = load_image(source).await?;
        debug!(
            event_id = %event,
            filename = %filename,
            width = image.width,
            height = image.height,
            operation = "load_image",
            "Image loaded"
        );

        let faces = self.resolver.detect_and_resolve(&image).await?;
        let face_count = faces.len();

        if face_count == 0 {
            return Ok(FileOutcome::Skipped {
                reason: SkipReason::NoFaces,
            });
        }

        let mut people = BTreeSet::new();
        for face in &faces {
            let person = sanitize::identifier(&face.person_id, "face_resolution").map_err(|_| {
                FaceError::InvalidResponse(format!("unusable person id {:?}", face.person_id))
            })?;
            people.insert(person);
        }

        let mut first_error = None;
        for person in &people {
            let placed = if face_count == 1 {
                self.store.place_individual(event, person, source, filename).await
            } else {
                self.store.place_group(event, person, source, filename).await
            };

            match placed {
                Ok(record) => info!(
                    event_id = %event,
                    filename = %filename,
                    person_id = %person,
                    stored_as = %record.filename,
                    visibility = ?record.visibility,
                    operation = "file_copy",
                    "Photo copied to person partition"
                ),
                Err(e) => {
                    // Keep copying for the remaining people; the file is
                    // reported failed once all partitions were attempted.
                    error!(
                        event_id = %event,
                        filename = %filename,
                        person_id = %person,
                        error = %e,
                        operation = "file_copy",
                        "Failed to copy photo to person partition"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(FileError::Store(e));
        }

        Ok(FileOutcome::Succeeded {
            face_count,
            person_ids: people.into_iter().map(Segment::into_string).collect(),
        })
    }
}

/// One allow-listed upload found at the start of a run
#[derive(Debug)]
enum BatchEntry {
    Photo(Segment),
    /// Present on disk under a name the sanitizer would rewrite
    UnsafeName(String),
}

impl BatchEntry {
    fn name(&self) -> &str {
        match self {
            BatchEntry::Photo(segment) => segment.as_str(),
            BatchEntry::UnsafeName(name) => name,
        }
    }
}

/// Allow-listed images in the raw directory, sorted by name
async fn list_batch(raw_dir: &Path) -> Result<Vec<BatchEntry>, RunError> {
    let mut entries = match tokio::fs::read_dir(raw_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(RunError::RawDirectoryMissing),
        Err(e) => return Err(RunError::ListFailed(e.to_string())),
    };

    let mut batch = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(RunError::ListFailed(e.to_string())),
        };

        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_file || !is_allowed_image(&name) || is_non_photo_artifact(&name) {
            continue;
        }

        // Names are used verbatim on disk, so they have to survive sanitization
        match sanitize::filename(&name, "process_event") {
            Ok(clean) if clean.as_str() == name => batch.push(BatchEntry::Photo(clean)),
            _ => batch.push(BatchEntry::UnsafeName(name)),
        }
    }

    batch.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(batch)
}

async fn load_image(path: &Path) -> Result<LoadedImage, FileError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| FileError::Load(e.to_string()))?;

    tokio::task::spawn_blocking(move || LoadedImage::decode(bytes))
        .await
        .map_err(|e| FileError::Load(e.to_string()))?
        .map_err(|e| FileError::Load(e.to_string()))
}

/// Schedules processing runs: one at a time per event, bounded overall
#[derive(Clone)]
pub struct ProcessingDispatcher {
    worker: Arc<ProcessingWorker>,
    run_slots: Arc<Semaphore>,
    event_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ProcessingDispatcher {
    pub fn new(worker: Arc<ProcessingWorker>, max_concurrent_runs: usize) -> Self {
        Self {
            worker,
            run_slots: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            event_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a run for `event_id` in the background and return immediately
    pub fn enqueue(&self, event_id: &str) -> JoinHandle<ProcessingRun> {
        let dispatcher = self.clone();
        let event_id = event_id.to_string();

        debug!(event_id = %event_id, "Processing run enqueued");

        tokio::spawn(async move { dispatcher.run(&event_id).await })
    }

    /// Enqueue a run for every event directory in the raw store
    pub async fn enqueue_backlog(&self, store: &PhotoStore) -> io::Result<Vec<JoinHandle<ProcessingRun>>> {
        let events = store.list_events().await?;

        info!(events = events.len(), "Enqueuing processing for existing uploads");

        Ok(events
            .iter()
            .map(|event| self.enqueue(event.as_str()))
            .collect())
    }

    async fn run(&self, event_id: &str) -> ProcessingRun {
        let key = sanitize::sanitize_identifier(event_id);
        let event_lock = {
            let mut locks = self.event_locks.lock().await;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let run = {
            // Serializes writes to this event's person partitions
            let _event_guard = event_lock.lock().await;

            match self.run_slots.acquire().await {
                Ok(_permit) => self.worker.process_event(event_id).await,
                Err(e) => {
                    error!(event_id = %event_id, error = %e, "Run slots closed");
                    ProcessingRun::start(event_id)
                        .abort(RunError::ListFailed("dispatcher shut down".to_string()))
                }
            }
        };

        self.release_event_lock(&key, event_lock).await;
        run
    }

    /// Drop the event's lock entry once no queued run still refers to it
    async fn release_event_lock(&self, key: &str, event_lock: Arc<Mutex<()>>) {
        let mut locks = self.event_locks.lock().await;
        // One reference in the map, one held here
        if Arc::strong_count(&event_lock) == 2 {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    async fn tracked_events(&self) -> usize {
        self.event_locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::{FaceRegion, MockFaceResolver, ResolvedFace};
    use image::{ImageBuffer, Rgb};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn write_png(path: &Path) {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(4, 4, Rgb([10, 20, 30]));
        img.save(path).unwrap();
    }

    fn faces(ids: &[&str]) -> Vec<ResolvedFace> {
        ids.iter()
            .map(|id| ResolvedFace {
                region: FaceRegion::default(),
                person_id: id.to_string(),
            })
            .collect()
    }

    fn setup() -> (tempfile::TempDir, PhotoStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PhotoStore::from_roots(dir.path().join("uploads"), dir.path().join("processed"));
        std::fs::create_dir_all(dir.path().join("uploads/E1")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_missing_raw_directory_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = PhotoStore::from_roots(dir.path().join("uploads"), dir.path().join("processed"));
        let worker = ProcessingWorker::new(store, Arc::new(MockFaceResolver::new()));

        let run = worker.process_event("E404").await;

        assert!(run.is_aborted());
        assert!(matches!(run.aborted, Some(RunError::RawDirectoryMissing)));
        assert!(run.files.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_event_id_aborts_run() {
        let (_dir, store) = setup();
        let worker = ProcessingWorker::new(store, Arc::new(MockFaceResolver::new()));

        let run = worker.process_event("../..").await;

        assert!(matches!(run.aborted, Some(RunError::InvalidEvent)));
    }

    #[tokio::test]
    async fn test_detection_error_is_contained() {
        let (dir, store) = setup();
        write_png(&dir.path().join("uploads/E1/a.png"));
        write_png(&dir.path().join("uploads/E1/b.png"));

        let mut resolver = MockFaceResolver::new();
        let mut calls = 0;
        resolver.expect_detect_and_resolve().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(FaceError::Request("model offline".to_string()))
            } else {
                Ok(faces(&["person_0001"]))
            }
        });

        let worker = ProcessingWorker::new(store, Arc::new(resolver));
        let run = worker.process_event("E1").await;

        assert!(!run.is_aborted());
        assert_eq!(
            run.outcome("a.png"),
            Some(&FileOutcome::Failed {
                kind: FileErrorKind::DetectionError
            })
        );
        assert_eq!(run.succeeded(), 1);
        assert!(dir
            .path()
            .join("processed/E1/person_0001/individual/b.png")
            .exists());
    }

    #[tokio::test]
    async fn test_two_faces_same_person_makes_one_group_copy() {
        let (dir, store) = setup();
        write_png(&dir.path().join("uploads/E1/twins.png"));

        let mut resolver = MockFaceResolver::new();
        resolver
            .expect_detect_and_resolve()
            .returning(|_| Ok(faces(&["person_0001", "person_0001"])));

        let worker = ProcessingWorker::new(store, Arc::new(resolver));
        let run = worker.process_event("E1").await;

        match run.outcome("twins.png") {
            Some(FileOutcome::Succeeded {
                face_count,
                person_ids,
            }) => {
                assert_eq!(*face_count, 2);
                assert_eq!(person_ids.len(), 1);
            }
            other => panic!("Expected success, got {other:?}"),
        }
        assert!(dir
            .path()
            .join("processed/E1/person_0001/group/watermarked_twins.png")
            .exists());
        assert!(!dir.path().join("processed/E1/person_0001/individual").exists());
    }

    #[tokio::test]
    async fn test_qr_codes_and_other_files_are_not_processed() {
        let (dir, store) = setup();
        write_png(&dir.path().join("uploads/E1/event_qr.png"));
        std::fs::write(dir.path().join("uploads/E1/notes.txt"), b"hi").unwrap();

        let mut resolver = MockFaceResolver::new();
        resolver.expect_detect_and_resolve().never();

        let worker = ProcessingWorker::new(store, Arc::new(resolver));
        let run = worker.process_event("E1").await;

        assert!(!run.is_aborted());
        assert!(run.files.is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_runs_in_background() {
        let (dir, store) = setup();
        write_png(&dir.path().join("uploads/E1/solo.png"));

        let mut resolver = MockFaceResolver::new();
        resolver
            .expect_detect_and_resolve()
            .returning(|_| Ok(faces(&["person_0007"])));

        let worker = Arc::new(ProcessingWorker::new(store.clone(), Arc::new(resolver)));
        let dispatcher = ProcessingDispatcher::new(worker, 2);

        let handles = dispatcher.enqueue_backlog(&store).await.unwrap();
        assert_eq!(handles.len(), 1);

        let run = handles.into_iter().next().unwrap().await.unwrap();
        assert_eq!(run.event_id, "E1");
        assert_eq!(run.succeeded(), 1);
        assert!(dir
            .path()
            .join("processed/E1/person_0007/individual/solo.png")
            .exists());
    }

    #[tokio::test]
    async fn test_unsafe_filename_is_reported_failed() {
        let (dir, store) = setup();
        write_png(&dir.path().join("uploads/E1/my photo.png"));
        write_png(&dir.path().join("uploads/E1/ok.png"));

        let mut resolver = MockFaceResolver::new();
        resolver
            .expect_detect_and_resolve()
            .times(1)
            .returning(|_| Ok(faces(&["person_0001"])));

        let worker = ProcessingWorker::new(store, Arc::new(resolver));
        let run = worker.process_event("E1").await;

        assert_eq!(run.files.len(), 2);
        assert_eq!(
            run.outcome("my photo.png"),
            Some(&FileOutcome::Failed {
                kind: FileErrorKind::InvalidFilename
            })
        );
        assert_eq!(run.failed(), 1);
        assert_eq!(run.succeeded(), 1);
    }

    /// Resolver that records how many calls overlap
    struct OverlapTracker {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl OverlapTracker {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl FaceResolver for OverlapTracker {
        async fn detect_and_resolve(&self, _image: &LoadedImage) -> Result<Vec<ResolvedFace>, FaceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(faces(&["person_0001"]))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_runs_for_same_event_never_overlap() {
        let (dir, store) = setup();
        for name in ["a.png", "b.png", "c.png"] {
            write_png(&dir.path().join("uploads/E1").join(name));
        }

        let tracker = Arc::new(OverlapTracker::new());
        let worker = Arc::new(ProcessingWorker::new(store, tracker.clone()));
        let dispatcher = ProcessingDispatcher::new(worker, 4);

        let handles: Vec<_> = (0..3).map(|_| dispatcher.enqueue("E1")).collect();
        for handle in handles {
            let run = handle.await.unwrap();
            assert_eq!(run.succeeded(), 3);
        }

        assert_eq!(tracker.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_locks_released_after_runs() {
        let (dir, store) = setup();
        write_png(&dir.path().join("uploads/E1/a.png"));
        std::fs::create_dir_all(dir.path().join("uploads/E2")).unwrap();

        let worker = Arc::new(ProcessingWorker::new(store, Arc::new(OverlapTracker::new())));
        let dispatcher = ProcessingDispatcher::new(worker, 2);

        let first = dispatcher.enqueue("E1");
        let second = dispatcher.enqueue("E1");
        let other = dispatcher.enqueue("E2");
        first.await.unwrap();
        second.await.unwrap();
        other.await.unwrap();

        assert_eq!(dispatcher.tracked_events().await, 0);
    }
}
