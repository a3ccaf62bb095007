//! Serving and consumption of robot action chunks.
//!
//! This crate defines:
//! - [`observation`]: validation and pixel canonicalization of camera input.
//! - [`ActionService`]: the inference service turning an observation into a
//!   fixed-length, de-normalized [`ActionChunk`].
//! - [`trajectory`]: reconstruction of end-effector motion from a chunk, for
//!   diagnostic playback.
//! - [`server`] / [`client`]: the `POST /act` REST contract on both ends.
//!
//! The model is opaque and plugs in through [`InferenceBackend`].

use async_trait::async_trait;

pub mod action;
pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod journal;
pub mod observation;
pub mod server;
pub mod service;
pub mod stats;
pub mod trajectory;
pub mod wire;

pub use action::{parse_action_log, ActionChunk, ActionStep, ACTION_DIM, NUM_ACTIONS_CHUNK};
pub use backend::{BackendError, InferenceBackend, ModelInput, ReplayBackend, StubBackend};
pub use client::RemotePolicy;
pub use config::{Config, DeployConfig, ServiceConfig, PROPRIO_DIM};
pub use error::{
    Error, IntegrationError, NormalizationError, Result, ServiceError, WireError,
};
pub use journal::{ChunkJournal, JournalEntry};
pub use observation::{normalize, Normalizer, Observation, RawImage, RawObservation};
pub use service::ActionService;
pub use stats::StatisticsTable;
pub use trajectory::{integrate, Pose, Trajectory};

/// Anything that maps an observation to an action chunk.
///
/// Implemented by the in-process [`ActionService`] and by [`RemotePolicy`],
/// so control loops and debugging tools do not care where inference runs.
#[async_trait]
pub trait ActionPolicy: Send + Sync {
    /// Returns the next chunk of actions, execution order first.
    async fn act(&self, observation: Observation) -> std::result::Result<ActionChunk, ServiceError>;
}
