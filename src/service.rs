//! The action inference service.
//!
//! Owns the loaded backend, the de-normalization bounds and the service
//! configuration; all of it is immutable after construction and shared by
//! reference across requests. Inference itself is serialized: the model's
//! device context is not safe for concurrent use.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::action::{ActionChunk, ActionStep};
use crate::backend::{InferenceBackend, ModelInput, RawActions};
use crate::config::ServiceConfig;
use crate::error::{ConfigError, Error, ServiceError, StatsError};
use crate::journal::{ChunkJournal, JournalEntry};
use crate::observation::{Normalizer, Observation, RawObservation};
use crate::stats::{NormBounds, StatisticsTable};
use crate::ActionPolicy;

pub struct ActionService {
    config: ServiceConfig,
    normalizer: Normalizer,
    action_bounds: NormBounds,
    proprio_bounds: Option<NormBounds>,
    backend: Arc<dyn InferenceBackend>,
    /// Held for the full duration of a backend call.
    inference_gate: Arc<Mutex<()>>,
    journal: Option<ChunkJournal>,
}

impl std::fmt::Debug for ActionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionService")
            .field("checkpoint_id", &self.config.checkpoint_id)
            .field("unnorm_key", &self.config.unnorm_key)
            .field("backend", &self.backend.name())
            .field("journal", &self.journal.is_some())
            .finish()
    }
}

impl ActionService {
    /// Validates the configuration against the statistics table and wraps the
    /// backend. Fails if `unnorm_key` is unknown or its bounds do not match
    /// the configured widths.
    pub fn new(
        config: ServiceConfig,
        stats: &StatisticsTable,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let dataset = stats.get(&config.unnorm_key)?;
        if dataset.action.dim() != config.action_dim {
            return Err(StatsError::Malformed {
                key: config.unnorm_key.clone(),
                message: format!(
                    "action bounds have {} dimensions, action_dim is {}",
                    dataset.action.dim(),
                    config.action_dim
                ),
            }
            .into());
        }

        let proprio_bounds = if config.use_proprio {
            let bounds = dataset.proprio.clone().ok_or_else(|| StatsError::Malformed {
                key: config.unnorm_key.clone(),
                message: "use_proprio is set but the dataset has no proprio bounds".to_string(),
            })?;
            if bounds.dim() != config.proprio_dim {
                return Err(StatsError::Malformed {
                    key: config.unnorm_key.clone(),
                    message: format!(
                        "proprio bounds have {} dimensions, proprio_dim is {}",
                        bounds.dim(),
                        config.proprio_dim
                    ),
                }
                .into());
            }
            Some(bounds)
        } else {
            None
        };

        backend
            .check_shape(config.chunk_horizon, config.action_dim)
            .map_err(|e| ConfigError::Invalid(format!("backend '{}': {e}", backend.name())))?;

        info!(
            checkpoint = %config.checkpoint_id,
            unnorm_key = %config.unnorm_key,
            backend = backend.name(),
            images = config.num_images_in_input,
            use_proprio = config.use_proprio,
            horizon = config.chunk_horizon,
            "action service ready"
        );

        Ok(Self {
            normalizer: Normalizer::new(config.image_size),
            action_bounds: dataset.action.clone(),
            proprio_bounds,
            backend,
            inference_gate: Arc::new(Mutex::new(())),
            journal: None,
            config,
        })
    }

    pub fn with_journal(mut self, journal: ChunkJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Normalizes a raw observation with this service's resolution check, then
    /// runs [`ActionService::act`].
    pub async fn act_raw(&self, raw: RawObservation) -> Result<ActionChunk, ServiceError> {
        let observation = self.normalizer.normalize(raw)?;
        self.act(observation).await
    }

    /// Produces exactly `chunk_horizon` de-normalized action steps.
    pub async fn act(&self, observation: Observation) -> Result<ActionChunk, ServiceError> {
        let task_description = observation.task_description.clone();
        let input = self.model_input(observation)?;

        let raw = self.run_backend(input).await?;
        let chunk = self.denormalize(raw)?;

        info!(task = %task_description, steps = chunk.len(), "Generated action chunk");
        for (i, step) in chunk.steps().iter().enumerate() {
            info!(step = i, action = ?step.values());
        }

        if let Some(journal) = &self.journal {
            let entry = JournalEntry::now(
                &self.config.checkpoint_id,
                &self.config.unnorm_key,
                &task_description,
                chunk.clone(),
            );
            if let Err(e) = journal.record(&entry) {
                warn!("failed to journal action chunk: {e}");
            }
        }

        Ok(chunk)
    }

    /// Enforces the required-field contract and prepares the backend input.
    fn model_input(&self, observation: Observation) -> Result<ModelInput, ServiceError> {
        let mut images = vec![observation.primary_image];

        match (self.config.requires_wrist_image(), observation.wrist_image) {
            (true, Some(wrist)) => images.push(wrist),
            (true, None) => {
                return Err(ServiceError::BadRequest(
                    "wrist_image is required when num_images_in_input = 2".to_string(),
                ))
            }
            (false, Some(_)) => debug!("ignoring wrist_image; num_images_in_input = 1"),
            (false, None) => {}
        }

        let proprio = match (&self.proprio_bounds, observation.proprio_state) {
            (Some(bounds), Some(state)) => {
                if state.len() != self.config.proprio_dim {
                    return Err(ServiceError::BadRequest(format!(
                        "state has {} values, expected {}",
                        state.len(),
                        self.config.proprio_dim
                    )));
                }
                if state.iter().any(|v| !v.is_finite()) {
                    return Err(ServiceError::BadRequest(
                        "state contains non-finite values".to_string(),
                    ));
                }
                Some(bounds.normalize(&state))
            }
            (Some(_), None) => {
                return Err(ServiceError::BadRequest(
                    "state is required when use_proprio is set".to_string(),
                ))
            }
            (None, Some(_)) => {
                debug!("ignoring state; use_proprio is off");
                None
            }
            (None, None) => None,
        };

        Ok(ModelInput {
            images,
            proprio,
            task_description: observation.task_description,
        })
    }

    async fn run_backend(&self, input: ModelInput) -> Result<RawActions, ServiceError> {
        // The guard moves into the blocking task so a dropped request cannot
        // release it while the model is still running.
        let guard = Arc::clone(&self.inference_gate).lock_owned().await;
        let backend = Arc::clone(&self.backend);

        let joined = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            backend.infer(&input)
        })
        .await;

        match joined {
            Ok(Ok(raw)) => Ok(raw),
            Ok(Err(e)) => {
                error!(backend = self.backend.name(), "inference failed: {e}");
                Err(ServiceError::InferenceFailure {
                    message: e.message,
                    detail: e.detail,
                })
            }
            Err(join_err) => {
                let detail = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    join_err.to_string()
                };
                error!(backend = self.backend.name(), "inference aborted: {detail}");
                Err(ServiceError::InferenceFailure {
                    message: "model call aborted".to_string(),
                    detail: Some(detail),
                })
            }
        }
    }

    fn denormalize(&self, raw: RawActions) -> Result<ActionChunk, ServiceError> {
        let failure = |message: String| ServiceError::InferenceFailure {
            message,
            detail: None,
        };

        if raw.len() != self.config.chunk_horizon {
            return Err(failure(format!(
                "model returned {} steps, chunk_horizon is {}",
                raw.len(),
                self.config.chunk_horizon
            )));
        }

        raw.into_iter()
            .enumerate()
            .map(|(i, row)| {
                if row.len() != self.config.action_dim {
                    return Err(failure(format!(
                        "step {i} has {} values, action_dim is {}",
                        row.len(),
                        self.config.action_dim
                    )));
                }
                if row.iter().any(|v| !v.is_finite()) {
                    return Err(failure(format!("step {i} contains non-finite values")));
                }
                if self.backend.output_is_normalized() {
                    Ok(ActionStep::new(self.action_bounds.unnormalize(&row)))
                } else {
                    Ok(ActionStep::new(row))
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(ActionChunk::new)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "model panicked".to_string()
    }
}

#[async_trait]
impl ActionPolicy for ActionService {
    async fn act(&self, observation: Observation) -> Result<ActionChunk, ServiceError> {
        ActionService::act(self, observation).await
    }
}
