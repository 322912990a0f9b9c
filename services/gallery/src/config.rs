use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the gallery service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// On-disk photo store locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Processing worker configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Identity registry configuration
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Face embedding service configuration
    pub detector: DetectorConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Photo store locations
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the raw upload store (`<uploads_dir>/<event_id>/<filename>`)
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    /// Root of the processed store (`<processed_dir>/<event_id>/<person_id>/...`)
    #[serde(default = "default_processed_dir")]
    pub processed_dir: PathBuf,
}

/// Processing worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Maximum number of events processed concurrently
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Enqueue every existing event directory at startup
    #[serde(default = "default_true")]
    pub process_backlog_on_startup: bool,
}

/// Identity registry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// File the learned descriptors are persisted to
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    /// Maximum descriptor distance for a face to match a known person
    #[serde(default = "default_match_tolerance")]
    pub match_tolerance: f32,
    /// Descriptor samples retained per person
    #[serde(default = "default_max_samples_per_person")]
    pub max_samples_per_person: usize,
}

/// Face embedding service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// URL the image bytes are POSTed to
    pub endpoint: String,
    /// Request timeout in seconds
    #[serde(default = "default_detector_timeout_secs")]
    pub timeout_secs: u64,
}

/// API configuration for the gallery endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "eventlens-gallery".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_processed_dir() -> PathBuf {
    PathBuf::from("processed")
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("known_faces.json")
}

fn default_match_tolerance() -> f32 {
    0.55
}

fn default_max_samples_per_person() -> usize {
    15
}

fn default_detector_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "eventlens-gallery")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(
                config::File::with_name("config/gallery")
                    .required(false)
            )
            .add_source(
                config::File::with_name("/etc/eventlens/gallery")
                    .required(false)
            )
            // Override with environment variables
            // GALLERY__DETECTOR__ENDPOINT -> detector.endpoint
            .add_source(
                config::Environment::with_prefix("GALLERY")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get detector request timeout as Duration
    pub fn detector_timeout(&self) -> Duration {
        Duration::from_secs(self.detector.timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            processed_dir: default_processed_dir(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            process_backlog_on_startup: default_true(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
            match_tolerance: default_match_tolerance(),
            max_samples_per_person: default_max_samples_per_person(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_match_tolerance(), 0.55);
        assert_eq!(default_max_samples_per_person(), 15);
        assert_eq!(default_uploads_dir(), PathBuf::from("uploads"));
        assert_eq!(default_processed_dir(), PathBuf::from("processed"));
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let config: Config = serde_json::from_str(
            r#"{ "detector": { "endpoint": "http://localhost:5000/faces" } }"#,
        )
        .unwrap();

        assert_eq!(config.detector.timeout_secs, 60);
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.processing.max_concurrent_runs, 4);
        assert!(config.processing.process_backlog_on_startup);
        assert_eq!(config.detector_timeout(), Duration::from_secs(60));
    }
}
