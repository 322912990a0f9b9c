use crate::sanitize::Segment;
use serde::Serialize;
use std::path::Path;
use url::Url;

/// Filename prefix marking a processed copy as a public group photo
pub const GROUP_TAG: &str = "watermarked_";

/// Image extensions accepted anywhere in the store (lowercase, no dot)
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Suffix of generated QR codes stored next to event uploads
const QR_ARTIFACT_SUFFIX: &str = "_qr.png";

/// Origin used only to build route paths
const ROUTE_BASE: &str = "http://gallery.local/";

/// Where a photo record was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoSource {
    /// Original file in the raw upload store
    RawUpload,
    /// Categorized copy in the processed store
    Processed,
}

/// Who may see a photo record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    PrivateToPerson,
}

/// One observed photo instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoRecord {
    pub event_id: Segment,
    /// On-disk leaf name, tag-prefixed for group copies
    pub filename: String,
    /// Filename with the group tag stripped; the dedup key
    pub base_name: String,
    pub source: PhotoSource,
    pub visibility: Visibility,
    /// Person partition holding the file (processed records only)
    pub person_id: Option<String>,
}

impl PhotoRecord {
    /// Record for a file in the raw upload store
    pub fn raw(event_id: Segment, filename: String) -> Self {
        Self {
            event_id,
            base_name: filename.clone(),
            filename,
            source: PhotoSource::RawUpload,
            visibility: Visibility::Public,
            person_id: None,
        }
    }

    /// Record for an untagged copy in a person's `individual/` partition
    pub fn individual(event_id: Segment, person_id: String, filename: String) -> Self {
        Self {
            event_id,
            base_name: filename.clone(),
            filename,
            source: PhotoSource::Processed,
            visibility: Visibility::PrivateToPerson,
            person_id: Some(person_id),
        }
    }

    /// Record for a tagged copy in a person's `group/` partition
    pub fn group(event_id: Segment, person_id: String, filename: String) -> Self {
        Self {
            event_id,
            base_name: base_name(&filename).to_string(),
            filename,
            source: PhotoSource::Processed,
            visibility: Visibility::Public,
            person_id: Some(person_id),
        }
    }

    /// Public URL the serving layer routes back to this file
    pub fn url(&self) -> String {
        PhotoRoute::for_source(self.source).url(&self.event_id, &self.filename)
    }
}

/// Serving-layer routes for photo files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoRoute {
    /// `/api/events/{event_id}/uploads/{filename}`
    Upload,
    /// `/photos/{event_id}/all/{filename}`
    PublicGroup,
}

impl PhotoRoute {
    pub fn for_source(source: PhotoSource) -> Self {
        match source {
            PhotoSource::RawUpload => PhotoRoute::Upload,
            PhotoSource::Processed => PhotoRoute::PublicGroup,
        }
    }

    /// Build the URL from a sanitized event id and an on-disk filename.
    ///
    /// Each segment is percent-encoded, so an identifier holding `?`, `#` or
    /// `%` still routes back to the same handler and decodes to itself.
    pub fn url(&self, event_id: &Segment, filename: &str) -> String {
        match self {
            PhotoRoute::Upload => route_path(&["api", "events", event_id.as_str(), "uploads", filename]),
            PhotoRoute::PublicGroup => route_path(&["photos", event_id.as_str(), "all", filename]),
        }
    }
}

/// Absolute path made of percent-encoded segments
fn route_path(segments: &[&str]) -> String {
    let mut url = match Url::parse(ROUTE_BASE) {
        Ok(url) => url,
        Err(_) => return format!("/{}", segments.join("/")),
    };

    if let Ok(mut path) = url.path_segments_mut() {
        path.clear().extend(segments);
    }

    url.path().to_string()
}

/// Strip the group tag, if present. Pure function of `filename`.
pub fn base_name(filename: &str) -> &str {
    filename.strip_prefix(GROUP_TAG).unwrap_or(filename)
}

/// Whether the filename carries the group tag
pub fn is_group_tagged(filename: &str) -> bool {
    filename.starts_with(GROUP_TAG) && filename.len() > GROUP_TAG.len()
}

/// Lowercased extension, without the dot
pub fn extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Whether the extension is on the image allow-list (case-insensitive)
pub fn is_allowed_image(filename: &str) -> bool {
    extension(filename)
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Known non-photo files that share the upload directory
pub fn is_non_photo_artifact(filename: &str) -> bool {
    filename.to_ascii_lowercase().ends_with(QR_ARTIFACT_SUFFIX)
}

/// Whether a listed file can be surfaced and later fetched back by name.
///
/// A name the sanitizer would rewrite could never be served under its own
/// URL, so such files are left out of listings.
pub fn is_servable_name(filename: &str) -> bool {
    crate::sanitize::sanitize_filename(filename) == filename
        && is_allowed_image(filename)
        && !is_non_photo_artifact(filename)
}

/// Get content type for an allow-listed image filename
pub fn content_type(filename: &str) -> &'static str {
    match extension(filename).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}
