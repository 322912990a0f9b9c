use crate::aggregator;
use crate::config::ApiConfig;
use crate::error::{GalleryError, GalleryResult};
use crate::photo::{content_type, is_allowed_image, is_group_tagged, PhotoRecord, PhotoSource};
use crate::sanitize::{self, Segment};
use crate::scanner;
use crate::store::{Partition, PhotoStore};
use crate::worker::ProcessingDispatcher;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::path::Path as FsPath;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

const EMPTY_GALLERY_MESSAGE: &str =
    "No photos available for this event yet. Photos will appear here after processing.";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PhotoStore>,
    pub dispatcher: ProcessingDispatcher,
}

/// Gallery listing response
#[derive(Debug, Serialize)]
pub struct GalleryResponse {
    pub success: bool,
    pub photos: Vec<PhotoEntry>,
    pub has_next: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One photo in a gallery listing
#[derive(Debug, Serialize)]
pub struct PhotoEntry {
    pub filename: String,
    pub source: PhotoSource,
    pub url: String,
}

impl From<PhotoRecord> for PhotoEntry {
    fn from(record: PhotoRecord) -> Self {
        Self {
            url: record.url(),
            filename: record.filename,
            source: record.source,
        }
    }
}

/// Response to a processing trigger
#[derive(Debug, Serialize)]
pub struct ProcessingAccepted {
    pub success: bool,
    pub event_id: String,
    pub message: String,
}

/// Photo bytes ready to stream back
#[derive(Debug)]
pub struct PhotoFile {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/events/:event_id/photos", get(list_photos))
        .route("/api/events/:event_id/process", post(trigger_processing))
        .route("/api/events/:event_id/uploads/:filename", get(get_upload))
        .route("/photos/:event_id/all/:filename", get(get_public_photo))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "gallery-service"
    }))
}

/// Public gallery listing for an event
#[instrument(skip(state))]
async fn list_photos(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<GalleryResponse>, GalleryError> {
    let event = sanitize::identifier(&event_id, "get_event_photos")?;

    info!(event_id = %event, operation = "get_event_photos", "Listing event photos");

    let photos = aggregator::aggregate(&state.store, &event).await.map_err(|e| {
        error!(event_id = %event, error = %e, operation = "get_event_photos", "Failed to aggregate photos");
        GalleryError::Io(e)
    })?;

    let message = photos.is_empty().then(|| EMPTY_GALLERY_MESSAGE.to_string());

    Ok(Json(GalleryResponse {
        success: true,
        photos: photos.into_iter().map(PhotoEntry::from).collect(),
        has_next: false,
        message,
    }))
}

/// Enqueue a processing run and return without waiting for it
#[instrument(skip(state))]
async fn trigger_processing(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<(StatusCode, Json<ProcessingAccepted>), GalleryError> {
    let event = sanitize::identifier(&event_id, "trigger_processing")?;

    // The run reports its own summary; nothing waits on the handle.
    drop(state.dispatcher.enqueue(event.as_str()));

    info!(event_id = %event, operation = "trigger_processing", "Processing enqueued");

    Ok((
        StatusCode::ACCEPTED,
        Json(ProcessingAccepted {
            success: true,
            event_id: event.into_string(),
            message: "Processing started".to_string(),
        }),
    ))
}

async fn get_upload(
    State(state): State<AppState>,
    Path((event_id, filename)): Path<(String, String)>,
) -> Result<Response, GalleryError> {
    let photo = fetch_raw(&state.store, &event_id, &filename).await?;
    Ok(photo_response(photo))
}

async fn get_public_photo(
    State(state): State<AppState>,
    Path((event_id, filename)): Path<(String, String)>,
) -> Result<Response, GalleryError> {
    let photo = fetch_public(&state.store, &event_id, &filename).await?;
    Ok(photo_response(photo))
}

fn photo_response(photo: PhotoFile) -> Response {
    (
        [
            (header::CONTENT_TYPE, photo.content_type),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        photo.bytes,
    )
        .into_response()
}

/// Fetch a raw upload by event and filename.
///
/// The extension is checked before anything touches the filesystem.
pub async fn fetch_raw(store: &PhotoStore, event_id: &str, filename: &str) -> GalleryResult<PhotoFile> {
    const OPERATION: &str = "serve_upload";

    let (event, name) = checked_request(event_id, filename, OPERATION)?;

    info!(event_id = %event, filename = %name, operation = OPERATION, "Serving raw upload");

    let attempted = store.raw_dir(&event).join(&name);
    let path = sanitize::resolve_within(store.uploads_root(), &[&event, &name], OPERATION)
        .await
        .map_err(|e| not_found(e, &event, &name, &attempted, OPERATION))?;

    read_photo(&path, &name, &event, OPERATION).await
}

/// Fetch a public group photo by event and tagged filename.
///
/// Person partitions are searched in sorted order and the first copy wins;
/// every copy of a group photo holds the same bytes.
pub async fn fetch_public(store: &PhotoStore, event_id: &str, filename: &str) -> GalleryResult<PhotoFile> {
    const OPERATION: &str = "serve_public_photo";

    let (event, name) = checked_request(event_id, filename, OPERATION)?;

    info!(event_id = %event, filename = %name, operation = OPERATION, "Serving public photo");

    let event_dir = store.processed_event_dir(&event);

    if !is_group_tagged(name.as_str()) {
        warn!(
            target: "security",
            event_id = %event,
            filename = %name,
            operation = OPERATION,
            "Public fetch of untagged photo refused"
        );
        return Err(not_found(GalleryError::NotFound, &event, &name, &event_dir, OPERATION));
    }

    let people = scanner::list_dirs(&event_dir).await?;
    for person in people {
        // Directory names that would not survive sanitization are never served
        if sanitize::sanitize_identifier(&person) != person {
            continue;
        }
        let Ok(person) = sanitize::identifier(&person, OPERATION) else {
            continue;
        };

        let group_dir = store.partition_dir(&event, &person, Partition::Group);
        match sanitize::resolve_within(&group_dir, &[&name], OPERATION).await {
            Ok(path) => return read_photo(&path, &name, &event, OPERATION).await,
            Err(GalleryError::NotFound) => continue,
            Err(e) => return Err(e),
        }
    }

    let attempted = event_dir.join("*").join(Partition::Group.as_str()).join(&name);
    Err(not_found(GalleryError::NotFound, &event, &name, &attempted, OPERATION))
}

/// Sanitize both path components and check the extension allow-list
fn checked_request(event_id: &str, filename: &str, operation: &str) -> GalleryResult<(Segment, Segment)> {
    let event = sanitize::identifier(event_id, operation)?;
    let name = sanitize::filename(filename, operation)?;

    if !is_allowed_image(name.as_str()) {
        warn!(
            event_id = %event,
            filename = %name,
            operation = operation,
            "Rejected request for disallowed file type"
        );
        return Err(GalleryError::InvalidFileType);
    }

    Ok((event, name))
}

async fn read_photo(path: &FsPath, name: &Segment, event: &Segment, operation: &str) -> GalleryResult<PhotoFile> {
    let is_file = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(not_found(GalleryError::NotFound, event, name, path, operation));
    }

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(not_found(GalleryError::NotFound, event, name, path, operation));
        }
        Err(e) => {
            error!(
                event_id = %event,
                filename = %name,
                path = %path.display(),
                error = %e,
                operation = operation,
                "Failed to read photo"
            );
            return Err(GalleryError::Io(e));
        }
    };

    Ok(PhotoFile {
        bytes,
        content_type: content_type(name.as_str()),
    })
}

/// Log a not-found with the path that was tried; other errors pass through
fn not_found(
    err: GalleryError,
    event: &Segment,
    name: &Segment,
    attempted: &FsPath,
    operation: &str,
) -> GalleryError {
    if matches!(err, GalleryError::NotFound) {
        error!(
            event_id = %event,
            filename = %name,
            path = %attempted.display(),
            operation = operation,
            "Photo not found"
        );
        metrics::counter!("gallery.serve.not_found").increment(1);
    }
    err
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting gallery API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn touch(path: &Path, bytes: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn store(dir: &Path) -> PhotoStore {
        PhotoStore::from_roots(dir.join("uploads"), dir.join("processed"))
    }

    #[tokio::test]
    async fn test_fetch_raw_serves_allowed_image() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("uploads/E1/A.JPG"), b"jpeg");

        let photo = fetch_raw(&store(dir.path()), "E1", "A.JPG").await.unwrap();

        assert_eq!(photo.bytes, b"jpeg");
        assert_eq!(photo.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_fetch_raw_checks_extension_first() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            fetch_raw(&store(dir.path()), "E1", "notes.txt").await,
            Err(GalleryError::InvalidFileType)
        ));
        assert!(matches!(
            fetch_raw(&store(dir.path()), "E1", "../../secret.txt").await,
            Err(GalleryError::InvalidFileType)
        ));
    }

    #[tokio::test]
    async fn test_fetch_raw_traversal_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("secret.jpg"), b"secret");
        touch(&dir.path().join("uploads/E1/A.jpg"), b"a");

        assert!(matches!(
            fetch_raw(&store(dir.path()), "E1", "../../secret.jpg").await,
            Err(GalleryError::NotFound)
        ));
        assert!(matches!(
            fetch_raw(&store(dir.path()), "..", "secret.jpg").await,
            Err(GalleryError::InvalidIdentifier)
        ));
    }

    #[tokio::test]
    async fn test_fetch_public_requires_group_tag() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("processed/E1/P1/individual/B.jpg"), b"private");
        touch(&dir.path().join("processed/E1/P1/group/B.jpg"), b"untagged");

        assert!(matches!(
            fetch_public(&store(dir.path()), "E1", "B.jpg").await,
            Err(GalleryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_fetch_public_searches_partitions() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("processed/E1/P1/individual/B.jpg"), b"private");
        touch(&dir.path().join("processed/E1/P2/group/watermarked_C.png"), b"group");

        let photo = fetch_public(&store(dir.path()), "E1", "watermarked_C.png")
            .await
            .unwrap();

        assert_eq!(photo.bytes, b"group");
        assert_eq!(photo.content_type, "image/png");
        assert!(matches!(
            fetch_public(&store(dir.path()), "E1", "watermarked_missing.png").await,
            Err(GalleryError::NotFound)
        ));
    }

    #[test]
    fn test_photo_entry_from_record() {
        let event = sanitize::identifier("E1", "test").unwrap();
        let entry = PhotoEntry::from(PhotoRecord::raw(event, "A.jpg".to_string()));

        assert_eq!(entry.url, "/api/events/E1/uploads/A.jpg");
        assert_eq!(
            serde_json::to_value(&entry).unwrap()["source"],
            serde_json::json!("raw_upload")
        );
    }
}
