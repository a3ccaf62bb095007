//! Action steps, action chunks and the plain-text action log.

use std::path::Path;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::ActionLogError;

/// Default number of steps the model predicts per call.
pub const NUM_ACTIONS_CHUNK: usize = 8;

/// Default width of one action: Δposition(3), Δorientation(3), gripper(1).
pub const ACTION_DIM: usize = 7;

/// One control command in physical units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionStep(Vec<f32>);

impl ActionStep {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Translation increment in meters, if the step is wide enough.
    pub fn delta_position(&self) -> Option<Vector3<f32>> {
        self.0.get(0..3).map(|s| Vector3::from_column_slice(s))
    }

    /// Axis-angle rotation increment in radians.
    pub fn delta_orientation(&self) -> Option<Vector3<f32>> {
        self.0.get(3..6).map(|s| Vector3::from_column_slice(s))
    }

    pub fn gripper(&self) -> Option<f32> {
        self.0.get(6).copied()
    }
}

/// The ordered output of one inference call; index 0 executes first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionChunk {
    steps: Vec<ActionStep>,
}

impl ActionChunk {
    pub fn new(steps: Vec<ActionStep>) -> Self {
        Self { steps }
    }

    pub fn from_rows(rows: Vec<Vec<f32>>) -> Self {
        Self::new(rows.into_iter().map(ActionStep::new).collect())
    }

    pub fn steps(&self) -> &[ActionStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Width of the steps, or `None` when the chunk is empty or ragged.
    pub fn action_dim(&self) -> Option<usize> {
        let first = self.steps.first()?.len();
        self.steps
            .iter()
            .all(|s| s.len() == first)
            .then_some(first)
    }

    /// Renders the chunk as an action log: one bracketed vector per line.
    pub fn to_log_string(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            let values: Vec<String> = step.values().iter().map(f32::to_string).collect();
            out.push('[');
            out.push_str(&values.join(" "));
            out.push_str("]\n");
        }
        out
    }

    pub fn write_log(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.to_log_string())
    }
}

impl IntoIterator for ActionChunk {
    type Item = ActionStep;
    type IntoIter = std::vec::IntoIter<ActionStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.into_iter()
    }
}

/// Parses an action log. Blank lines are skipped; every vector must have the
/// same width.
pub fn parse_action_log(text: &str) -> Result<ActionChunk, ActionLogError> {
    let mut rows: Vec<Vec<f32>> = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let body = trimmed.trim_matches(|c| c == '[' || c == ']');
        let row = body
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|tok| !tok.is_empty())
            .map(|tok| {
                tok.parse::<f32>().map_err(|e| ActionLogError {
                    line: line_no,
                    message: format!("'{tok}' is not a number ({e})"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if row.is_empty() {
            return Err(ActionLogError {
                line: line_no,
                message: "empty action vector".to_string(),
            });
        }
        if let Some(first) = rows.first() {
            if first.len() != row.len() {
                return Err(ActionLogError {
                    line: line_no,
                    message: format!("expected {} values, found {}", first.len(), row.len()),
                });
            }
        }
        rows.push(row);
    }

    Ok(ActionChunk::from_rows(rows))
}

pub fn read_action_log(path: impl AsRef<Path>) -> crate::error::Result<ActionChunk> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_action_log(&text)?)
}
