//! EventLens Gallery Service
//!
//! Photo ingestion and gallery serving for EventLens events. Organizers upload
//! photos into a per-event raw directory; a background worker detects faces,
//! resolves each one to a person, and files copies into an identity-partitioned
//! processed store. The gallery API merges the raw and processed views into a
//! single deduplicated public listing and serves the files behind it.
//!
//! ## Features
//!
//! - **Face-Partitioned Processing**: single-face photos are filed privately
//!   per person; group photos are tagged and filed for every person in them
//! - **Deduplicated Listings**: a processed group copy replaces its raw
//!   original, and copies held by several people appear once
//! - **Safe Path Resolution**: every identifier and filename is sanitized and
//!   every served path is checked to stay inside its store
//! - **Contained Failures**: corrupt images and detector errors are recorded
//!   per file and never stop a run
//!
//! ## Architecture
//!
//! ```text
//!  upload ──▶ uploads/<event>/            processed/<event>/<person>/
//!                  │                          individual/<file>
//!                  ▼                          group/watermarked_<file>
//!          ┌──────────────┐                        ▲        │
//!          │ Processing   │  ┌──────────────┐      │        │
//!          │ Dispatcher   │─▶│ Processing   │──────┘        │
//!          └──────────────┘  │ Worker       │               │
//!                            └──────────────┘               │
//!                                   │                       ▼
//!                                   ▼                ┌──────────────┐
//!                            ┌──────────────┐        │ Scanners     │
//!                            │ Face         │        │ Aggregator   │
//!                            │ Resolution   │        └──────────────┘
//!                            └──────────────┘               │
//!                                                           ▼
//!                                                    ┌──────────────┐
//!                                                    │ Gallery API  │
//!                                                    └──────────────┘
//! ```

pub mod aggregator;
pub mod config;
pub mod error;
pub mod face;
pub mod photo;
pub mod sanitize;
pub mod scanner;
pub mod serving;
pub mod store;
pub mod worker;

pub use aggregator::aggregate;
pub use config::Config;
pub use error::{GalleryError, GalleryResult};
pub use face::{
    FaceDetector, FaceError, FaceResolution, FaceResolver, HttpFaceDetector, IdentityRegistry,
    IdentityRegistryBuilder, LoadedImage, ResolvedFace,
};
pub use photo::{PhotoRecord, PhotoSource, Visibility};
pub use sanitize::Segment;
pub use scanner::{scan_processed, scan_raw};
pub use serving::{create_router, fetch_public, fetch_raw, start_api_server, AppState};
pub use store::PhotoStore;
pub use worker::{FileOutcome, ProcessingDispatcher, ProcessingRun, ProcessingWorker, RunError};
