//! Face resolution capability.
//!
//! Descriptor extraction is delegated to an external embedding service through
//! [`FaceDetector`]; turning descriptors into stable person identifiers is the
//! job of the [`IdentityRegistry`], which learns new people as they appear.
//!
//! The registry is shared, mutated state for the whole process. [`FaceResolution`]
//! owns it behind a single async mutex held across detect, resolve and learn,
//! so concurrent runs for different events can never interleave updates to the
//! identity table.

use crate::config::{DetectorConfig, IdentityConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Errors raised by the face capability
#[derive(Debug, Error)]
pub enum FaceError {
    #[error("Face detector request failed: {0}")]
    Request(String),

    #[error("Face detector returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Identity registry persistence failed: {0}")]
    Persistence(String),
}

/// Face bounding box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

/// A face found by the detector, with its descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub region: FaceRegion,
    pub descriptor: Vec<f32>,
}

/// A detected face mapped to a person identifier
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFace {
    pub region: FaceRegion,
    pub person_id: String,
}

/// A decoded image ready for face detection
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Original encoded bytes, as uploaded
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl LoadedImage {
    /// Decode the bytes to make sure they are a readable image
    pub fn decode(bytes: Vec<u8>) -> Result<Self, image::ImageError> {
        let decoded = image::load_from_memory(&bytes)?;

        Ok(Self {
            width: decoded.width(),
            height: decoded.height(),
            bytes,
        })
    }
}

/// Extracts face descriptors from an image
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, image: &LoadedImage) -> Result<Vec<DetectedFace>, FaceError>;
}

/// Detects faces and resolves each one to a person identifier.
///
/// Implementations may create new person identifiers on first sight of a
/// descriptor. Calls are serialized by the implementation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FaceResolver: Send + Sync {
    async fn detect_and_resolve(&self, image: &LoadedImage) -> Result<Vec<ResolvedFace>, FaceError>;
}

/// Response body of the embedding service
#[derive(Debug, Deserialize)]
struct DetectResponse {
    faces: Vec<DetectedFace>,
}

/// [`FaceDetector`] backed by an HTTP embedding service
pub struct HttpFaceDetector {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpFaceDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self, FaceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FaceError::Request(e.to_string()))?;

        info!(endpoint = %config.endpoint, "Face detector client initialized");

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl FaceDetector for HttpFaceDetector {
    async fn detect(&self, image: &LoadedImage) -> Result<Vec<DetectedFace>, FaceError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.bytes.clone())
            .send()
            .await
            .map_err(|e| FaceError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FaceError::Request(format!("embedding service returned {status}")));
        }

        let body: DetectResponse = response
            .json()
            .await
            .map_err(|e| FaceError::InvalidResponse(e.to_string()))?;

        if body.faces.iter().any(|f| f.descriptor.is_empty()) {
            return Err(FaceError::InvalidResponse("face without descriptor".to_string()));
        }

        Ok(body.faces)
    }
}

/// One known person and their most recent descriptor samples
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Identity {
    person_id: String,
    samples: Vec<Vec<f32>>,
}

impl Identity {
    fn mean(&self) -> Vec<f32> {
        let len = self.samples.first().map(Vec::len).unwrap_or(0);
        let mut mean = vec![0.0f32; len];

        for sample in &self.samples {
            for (acc, value) in mean.iter_mut().zip(sample) {
                *acc += value;
            }
        }

        let count = self.samples.len().max(1) as f32;
        mean.iter_mut().for_each(|v| *v /= count);
        mean
    }
}

/// On-disk form of the registry
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistrySnapshot {
    identities: Vec<Identity>,
}

/// Table of learned face descriptors, keyed by person identifier
///
/// A descriptor matches a person when its Euclidean distance to that person's
/// mean descriptor is within the tolerance; the closest person wins. Matches
/// reinforce the person with the new sample (keeping the most recent
/// `max_samples`); misses create `person_NNNN`.
pub struct IdentityRegistry {
    identities: Vec<Identity>,
    tolerance: f32,
    max_samples: usize,
    path: Option<PathBuf>,
}

impl IdentityRegistry {
    /// Load the registry persisted at the configured path.
    ///
    /// A missing file starts an empty registry; an unreadable one is logged
    /// and also starts empty.
    pub async fn load(config: &IdentityConfig) -> Self {
        let mut registry = IdentityRegistryBuilder::new()
            .tolerance(config.match_tolerance)
            .max_samples(config.max_samples_per_person)
            .persist_to(&config.registry_path)
            .build();

        match tokio::fs::read(&config.registry_path).await {
            Ok(bytes) => match serde_json::from_slice::<RegistrySnapshot>(&bytes) {
                Ok(snapshot) => {
                    registry.identities = snapshot.identities;
                    info!(
                        identities = registry.identities.len(),
                        path = %config.registry_path.display(),
                        "Identity registry loaded"
                    );
                }
                Err(e) => {
                    error!(
                        error = %e,
                        path = %config.registry_path.display(),
                        "Failed to parse identity registry, starting empty"
                    );
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %config.registry_path.display(), "No identity registry yet, starting empty");
            }
            Err(e) => {
                error!(
                    error = %e,
                    path = %config.registry_path.display(),
                    "Failed to read identity registry, starting empty"
                );
            }
        }

        registry
    }

    /// Number of known people
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Closest known person within tolerance, with its distance
    fn best_match(&self, descriptor: &[f32]) -> Option<(usize, f32)> {
        self.identities
            .iter()
            .enumerate()
            .map(|(index, identity)| (index, distance(&identity.mean(), descriptor)))
            .filter(|(_, d)| d.is_finite())
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .filter(|(_, d)| *d <= self.tolerance)
    }

    /// Return the matching person without learning anything
    pub fn recognize(&self, descriptor: &[f32]) -> Option<&str> {
        self.best_match(descriptor)
            .map(|(index, _)| self.identities[index].person_id.as_str())
    }

    /// Match `descriptor` to a known person, reinforcing them, or learn a new one
    pub fn learn(&mut self, descriptor: &[f32]) -> String {
        if let Some((index, d)) = self.best_match(descriptor) {
            let identity = &mut self.identities[index];
            identity.samples.push(descriptor.to_vec());
            if identity.samples.len() > self.max_samples {
                let excess = identity.samples.len() - self.max_samples;
                identity.samples.drain(..excess);
            }

            debug!(person_id = %identity.person_id, distance = d, "Face matched known person");
            return identity.person_id.clone();
        }

        let person_id = format!("person_{:04}", self.identities.len() + 1);
        self.identities.push(Identity {
            person_id: person_id.clone(),
            samples: vec![descriptor.to_vec()],
        });

        info!(person_id = %person_id, "New identity learned");
        person_id
    }

    /// Write the registry to its configured path, if any
    pub async fn persist(&self) -> Result<(), FaceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let snapshot = RegistrySnapshot {
            identities: self.identities.clone(),
        };
        let bytes =
            serde_json::to_vec(&snapshot).map_err(|e| FaceError::Persistence(e.to_string()))?;

        write_atomic(path, &bytes)
            .await
            .map_err(|e| FaceError::Persistence(e.to_string()))
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    tokio::fs::write(&temp, bytes).await?;
    tokio::fs::rename(&temp, path).await
}

/// Euclidean distance; mismatched lengths never match
fn distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return f32::INFINITY;
    }

    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Builder for creating IdentityRegistry with custom settings
pub struct IdentityRegistryBuilder {
    tolerance: f32,
    max_samples: usize,
    path: Option<PathBuf>,
}

impl IdentityRegistryBuilder {
    pub fn new() -> Self {
        Self {
            tolerance: 0.55,
            max_samples: 15,
            path: None,
        }
    }

    pub fn tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples.max(1);
        self
    }

    pub fn persist_to(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn build(self) -> IdentityRegistry {
        IdentityRegistry {
            identities: Vec::new(),
            tolerance: self.tolerance,
            max_samples: self.max_samples,
            path: self.path,
        }
    }
}

impl Default for IdentityRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// [`FaceResolver`] combining a detector with the process-wide identity registry
pub struct FaceResolution<D> {
    detector: D,
    registry: Mutex<IdentityRegistry>,
}

impl<D: FaceDetector> FaceResolution<D> {
    pub fn new(detector: D, registry: IdentityRegistry) -> Self {
        Self {
            detector,
            registry: Mutex::new(registry),
        }
    }

    /// Number of people learned so far
    pub async fn known_people(&self) -> usize {
        self.registry.lock().await.len()
    }
}

#[async_trait]
impl<D: FaceDetector> FaceResolver for FaceResolution<D> {
    #[instrument(skip_all, fields(width = image.width, height = image.height))]
    async fn detect_and_resolve(&self, image: &LoadedImage) -> Result<Vec<ResolvedFace>, FaceError> {
        let mut registry = self.registry.lock().await;

        let faces = self.detector.detect(image).await?;
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let resolved: Vec<ResolvedFace> = faces
            .iter()
            .map(|face| ResolvedFace {
                region: face.region,
                person_id: registry.learn(&face.descriptor),
            })
            .collect();

        // Identities stay valid in memory even if the write fails; the next
        // successful persist catches the file up.
        if let Err(e) = registry.persist().await {
            warn!(error = %e, "Failed to persist identity registry");
        }

        Ok(resolved)
    }
}
