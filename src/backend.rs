//! The opaque model behind the service.
//!
//! Weights, tokenization and the forward pass are not part of this crate; a
//! model is anything that turns a [`ModelInput`] into a chunk of actions,
//! normally in the normalized [-1,1] space. Calls are blocking and may take
//! seconds.

use ndarray::Array3;
use thiserror::Error;

use crate::action::ActionChunk;

/// Everything the model sees for one request.
#[derive(Debug, Clone)]
pub struct ModelInput {
    /// Canonical 8-bit HWC images, primary camera first.
    pub images: Vec<Array3<u8>>,
    /// Proprio state already mapped into [-1,1], when the model uses it.
    pub proprio: Option<Vec<f32>>,
    pub task_description: String,
}

/// Raw model output: one normalized row per predicted step.
pub type RawActions = Vec<Vec<f32>>;

/// The model call failed.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub detail: Option<String>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A loaded policy. Implementations are shared read-only across requests.
pub trait InferenceBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn infer(&self, input: &ModelInput) -> Result<RawActions, BackendError>;

    /// Whether [`infer`](Self::infer) returns [-1,1] values that still need
    /// de-normalizing. Backends that already emit physical actions say no.
    fn output_is_normalized(&self) -> bool {
        true
    }

    /// Called once at service startup. Backends whose output shape is known
    /// up front reject a mismatched configuration here instead of failing
    /// every request.
    fn check_shape(&self, _horizon: usize, _action_dim: usize) -> Result<(), BackendError> {
        Ok(())
    }
}

fn check_rows(rows: &[Vec<f32>], horizon: usize, action_dim: usize) -> Result<(), BackendError> {
    if rows.len() != horizon {
        return Err(BackendError::new(format!(
            "backend produces {} steps, chunk_horizon is {horizon}",
            rows.len()
        )));
    }
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != action_dim) {
        return Err(BackendError::new(format!(
            "step {i} has {} values, action_dim is {action_dim}",
            row.len()
        )));
    }
    Ok(())
}

/// Returns the same normalized chunk for every request.
#[derive(Debug, Clone)]
pub struct StubBackend {
    rows: RawActions,
}

impl StubBackend {
    /// A chunk of `horizon` rows filled with `value`.
    pub fn constant(horizon: usize, action_dim: usize, value: f32) -> Self {
        Self {
            rows: vec![vec![value; action_dim]; horizon],
        }
    }

    /// Zeros, which de-normalize to the midpoint of every dataset range.
    pub fn zeros(horizon: usize, action_dim: usize) -> Self {
        Self::constant(horizon, action_dim, 0.0)
    }
}

impl InferenceBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn infer(&self, _input: &ModelInput) -> Result<RawActions, BackendError> {
        Ok(self.rows.clone())
    }

    fn check_shape(&self, horizon: usize, action_dim: usize) -> Result<(), BackendError> {
        check_rows(&self.rows, horizon, action_dim)
    }
}

/// Replays a recorded action log for every request.
///
/// Logs written by `act --output` hold physical actions, which is what
/// [`ReplayBackend::new`] expects. Use [`ReplayBackend::normalized`] for a
/// dump of raw [-1,1] model outputs.
#[derive(Debug, Clone)]
pub struct ReplayBackend {
    rows: RawActions,
    normalized: bool,
}

impl ReplayBackend {
    /// A log of already de-normalized actions, served as-is.
    pub fn new(chunk: ActionChunk) -> Self {
        Self {
            rows: chunk.to_response(),
            normalized: false,
        }
    }

    /// A log of raw model outputs, de-normalized by the service.
    pub fn normalized(chunk: ActionChunk) -> Self {
        Self {
            rows: chunk.to_response(),
            normalized: true,
        }
    }
}

impl InferenceBackend for ReplayBackend {
    fn name(&self) -> &str {
        "replay"
    }

    fn infer(&self, _input: &ModelInput) -> Result<RawActions, BackendError> {
        if self.rows.is_empty() {
            return Err(BackendError::new("replay log is empty"));
        }
        Ok(self.rows.clone())
    }

    fn output_is_normalized(&self) -> bool {
        self.normalized
    }

    fn check_shape(&self, horizon: usize, action_dim: usize) -> Result<(), BackendError> {
        check_rows(&self.rows, horizon, action_dim)
            .map_err(|e| BackendError::new(format!("replay log: {}", e.message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> ModelInput {
        ModelInput {
            images: vec![Array3::zeros((1, 1, 3))],
            proprio: None,
            task_description: "push the plate".to_string(),
        }
    }

    #[test]
    fn stub_returns_requested_shape() {
        let rows = StubBackend::constant(3, 7, 0.5).infer(&input()).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r == &vec![0.5; 7]));
    }

    #[test]
    fn replay_returns_recorded_rows() {
        let chunk = ActionChunk::from_rows(vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        let rows = ReplayBackend::new(chunk).infer(&input()).unwrap();
        assert_eq!(rows, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);

        let empty = ReplayBackend::new(ActionChunk::default());
        assert!(empty.infer(&input()).is_err());
    }

    #[test]
    fn replay_logs_are_physical_unless_marked_normalized() {
        let chunk = ActionChunk::from_rows(vec![vec![0.0; 7]]);
        assert!(!ReplayBackend::new(chunk.clone()).output_is_normalized());
        assert!(ReplayBackend::normalized(chunk).output_is_normalized());
        assert!(StubBackend::zeros(1, 7).output_is_normalized());
    }

    #[test]
    fn shape_check_reports_horizon_and_width() {
        let replay = ReplayBackend::new(ActionChunk::from_rows(vec![vec![0.0; 7]; 5]));
        assert!(replay.check_shape(5, 7).is_ok());

        let err = replay.check_shape(8, 7).unwrap_err();
        assert!(err.message.contains("5 steps"), "{}", err.message);
        assert!(err.message.contains("replay log"));

        let err = replay.check_shape(5, 6).unwrap_err();
        assert!(err.message.contains("action_dim is 6"), "{}", err.message);

        assert!(StubBackend::zeros(8, 7).check_shape(8, 7).is_ok());
        assert!(StubBackend::zeros(8, 7).check_shape(4, 7).is_err());
    }
}
