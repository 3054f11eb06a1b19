//! Transformer flight controller
//!
//! Feeds a rolling window of telemetry rows through a trained
//! [`FlightTransformer`] and reads the next rotor speeds from its prediction.
//!
//! Each row is laid out as
//!
//! ```text
//! [desired body velocity (3) | angular velocity (3) | acceleration (3) | rotor speeds (4)]
//! ```
//!
//! The first three columns are the model's condition features and the other
//! ten its sequence features. Until the window holds `seq_len` rows the
//! controller issues no commands.
//!
//! A model trained on a [`TelemetryDataset`](crate::train::TelemetryDataset)
//! sees min-max scaled rows. Give the controller the same [`Normalization`] so
//! it scales each reading on the way in and maps predicted rotor speeds back
//! to rad/s on the way out.

use crate::error::{invalid_config, Result};
use crate::model::FlightTransformer;
use crate::sim::{Observation, OMEGA_MAX, OMEGA_MIN, ROTORS};
use crate::tensor::Tensor;
use crate::train::Normalization;
use log::warn;
use std::collections::VecDeque;

/// Condition columns: desired body-frame velocity
pub const COND_FEATURES: usize = 3;
/// Sequence columns: angular velocity, acceleration, rotor speeds
pub const SEQ_FEATURES: usize = 10;
/// Offset of the rotor speeds within the sequence features
const ROTOR_OFFSET: usize = 6;

pub struct TransformerController {
    model: FlightTransformer,
    normalization: Option<Normalization>,
    history: VecDeque<[f64; COND_FEATURES + SEQ_FEATURES]>,
}

impl TransformerController {
    /// Wrap a model whose config matches the controller's row layout
    pub fn new(model: FlightTransformer) -> Result<Self> {
        let config = &model.config;
        if config.cond_features != COND_FEATURES || config.seq_features != SEQ_FEATURES {
            return Err(invalid_config(format!(
                "controller needs {COND_FEATURES} condition and {SEQ_FEATURES} sequence features, model has {} and {}",
                config.cond_features, config.seq_features
            )));
        }
        let capacity = config.seq_len;
        Ok(Self {
            model,
            normalization: None,
            history: VecDeque::with_capacity(capacity),
        })
    }

    /// Scale inputs and outputs with the ranges the model was trained on
    pub fn with_normalization(mut self, normalization: Normalization) -> Result<Self> {
        if normalization.width() != COND_FEATURES + SEQ_FEATURES {
            return Err(invalid_config(format!(
                "controller rows have {} columns, normalization covers {}",
                COND_FEATURES + SEQ_FEATURES,
                normalization.width()
            )));
        }
        self.normalization = Some(normalization);
        Ok(self)
    }

    pub fn model(&self) -> &FlightTransformer {
        &self.model
    }

    /// Rows currently held
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn is_warm(&self) -> bool {
        self.history.len() == self.model.config.seq_len
    }

    /// Forget all history
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Record one control step and return new rotor commands once warm
    ///
    /// The oldest row is dropped when the window is full. Commands are taken
    /// from the last position's predicted rotor speeds, unscaled when a
    /// normalization is set, then clamped to
    /// `[OMEGA_MIN, OMEGA_MAX]`. A non-finite prediction yields `None`.
    pub fn command(
        &mut self,
        desired_velocity: [f64; 3],
        obs: &Observation,
    ) -> Option<[f64; ROTORS]> {
        let seq_len = self.model.config.seq_len;
        if self.history.len() == seq_len {
            self.history.pop_front();
        }

        let mut row = [0.0; COND_FEATURES + SEQ_FEATURES];
        row[..3].copy_from_slice(&desired_velocity);
        row[3..6].copy_from_slice(&obs.angular_velocity);
        row[6..9].copy_from_slice(&obs.accelerometer);
        row[9..].copy_from_slice(&obs.rotor_speeds);
        if let Some(norm) = &self.normalization {
            norm.scale_row(&mut row);
        }
        self.history.push_back(row);

        if !self.is_warm() {
            return None;
        }

        let input = Tensor::new(
            self.history.iter().flatten().copied().collect(),
            vec![seq_len, COND_FEATURES + SEQ_FEATURES],
        );
        let output = self.model.inference(&input);
        let last = output.row(seq_len - 1);
        let rotors: [f64; ROTORS] = std::array::from_fn(|i| {
            let y = last[ROTOR_OFFSET + i];
            match &self.normalization {
                Some(norm) => norm.unscale(COND_FEATURES + ROTOR_OFFSET + i, y),
                None => y,
            }
        });
        if rotors.iter().any(|w| !w.is_finite()) {
            warn!("controller produced non-finite rotor speeds; holding previous command");
            return None;
        }
        Some(rotors.map(|w| w.clamp(OMEGA_MIN, OMEGA_MAX)))
    }
}
