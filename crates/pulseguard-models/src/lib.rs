//! `pulseguard-models` – the model registry seam.
//!
//! The heavy registry implementation is an external collaborator; the
//! runtime only depends on the narrow [`ModelRegistry`] contract plus two
//! local pieces:
//!
//! - [`InMemoryModelRegistry`] – reference implementation for tests and
//!   single-node demo runs, with content-hash verification on artifact load.
//! - [`ModelCache`] – the warm in-process cache of loaded artifacts, keyed
//!   by `(model_name, version)` with bounded size and last-used eviction.

pub mod cache;
pub mod registry;

pub use cache::ModelCache;
pub use registry::{ArtifactHandle, ArtifactScorer, InMemoryModelRegistry, ModelRegistry};

use thiserror::Error;

/// Errors from registry operations.
#[derive(Error, Debug)]
pub enum ModelError {
    /// No version of the model exists in a servable stage.
    #[error("model '{0}' not found")]
    NotFound(String),

    /// The named version does not exist.
    #[error("model '{name}' has no version {version}")]
    VersionNotFound { name: String, version: u32 },

    /// The artifact's content hash did not match the registered hash.  The
    /// version must be quarantined and never served.
    #[error("integrity violation for model '{name}' version {version}")]
    IntegrityViolation { name: String, version: u32 },

    /// The registry backend could not answer.
    #[error("model registry unavailable: {0}")]
    Unavailable(String),
}
