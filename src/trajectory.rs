//! Reconstructs end-effector motion from an action chunk for playback.
//!
//! Orientation increments are summed component-wise as axis-angle vectors.
//! That is only a small-angle approximation of rotation composition, good
//! enough to eyeball a chunk but not for physically accurate trajectories.
//!
//! Each pose also gets a unit heading `orientation / |orientation|` for
//! drawing an orientation indicator. A zero orientation has no direction:
//! such poses get `None` and draw no indicator, and [`Trajectory::headings`]
//! reports them as [`IntegrationError::ZeroNorm`].

use nalgebra::{Unit, Vector3};
use serde::{Deserialize, Serialize};

use crate::action::{ActionChunk, ActionStep};
use crate::error::IntegrationError;

/// Length of the orientation indicator, in meters.
pub const ARROW_LENGTH: f32 = 0.1;

/// End-effector position plus axis-angle orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vector3<f32>,
    pub orientation: Vector3<f32>,
}

impl Pose {
    pub fn new(position: Vector3<f32>, orientation: Vector3<f32>) -> Self {
        Self {
            position,
            orientation,
        }
    }

    pub fn origin() -> Self {
        Self::new(Vector3::zeros(), Vector3::zeros())
    }

    /// Takes the first six proprio channels (xyz, axis-angle).
    pub fn from_state(state: &[f32]) -> Option<Self> {
        let position = state.get(0..3)?;
        let orientation = state.get(3..6)?;
        Some(Self::new(
            Vector3::from_column_slice(position),
            Vector3::from_column_slice(orientation),
        ))
    }

    pub fn heading(&self) -> Option<Unit<Vector3<f32>>> {
        Unit::try_new(self.orientation, 0.0)
    }

    fn step(&self, action: &ActionStep) -> Option<Self> {
        Some(Self::new(
            self.position + action.delta_position()?,
            self.orientation + action.delta_orientation()?,
        ))
    }
}

/// An orientation indicator anchored at a pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Arrow {
    pub origin: Vector3<f32>,
    pub vector: Vector3<f32>,
}

/// Poses over time; always one longer than the chunk that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    poses: Vec<Pose>,
    headings: Vec<Option<Unit<Vector3<f32>>>>,
}

/// Accumulates `chunk` onto `initial`. Either the whole chunk integrates or
/// the first malformed step is reported.
pub fn integrate(initial: Pose, chunk: &ActionChunk) -> Result<Trajectory, IntegrationError> {
    let mut poses = Vec::with_capacity(chunk.len() + 1);
    poses.push(initial);

    let mut current = initial;
    for (index, action) in chunk.steps().iter().enumerate() {
        current = current
            .step(action)
            .ok_or(IntegrationError::MalformedStep {
                index,
                len: action.len(),
            })?;
        poses.push(current);
    }

    let headings = poses.iter().map(Pose::heading).collect();
    Ok(Trajectory { poses, headings })
}

impl Trajectory {
    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = &Vector3<f32>> {
        self.poses.iter().map(|p| &p.position)
    }

    /// Heading of pose `index`, `None` for a zero orientation or out of range.
    pub fn heading(&self, index: usize) -> Option<Unit<Vector3<f32>>> {
        self.headings.get(index).copied().flatten()
    }

    /// Every heading, failing at the first pose without one.
    pub fn headings(&self) -> Result<Vec<Unit<Vector3<f32>>>, IntegrationError> {
        self.headings
            .iter()
            .enumerate()
            .map(|(index, h)| h.ok_or(IntegrationError::ZeroNorm { index }))
            .collect()
    }

    /// Orientation indicators of the given length; poses without a heading
    /// are skipped.
    pub fn orientation_arrows(&self, length: f32) -> Vec<Arrow> {
        self.poses
            .iter()
            .zip(&self.headings)
            .filter_map(|(pose, heading)| {
                heading.map(|h| Arrow {
                    origin: pose.position,
                    vector: h.into_inner() * length,
                })
            })
            .collect()
    }

    /// Per-axis peak-to-peak extent of the positions.
    pub fn position_range(&self) -> Vector3<f32> {
        let mut positions = self.positions();
        let Some(first) = positions.next() else {
            return Vector3::zeros();
        };
        let (lo, hi) = positions.fold((*first, *first), |(lo, hi), p| (lo.inf(p), hi.sup(p)));
        hi - lo
    }
}
