//! Autoencoder-based anomaly detection
//!
//! Normal rows reconstruct with low error while anomalies reconstruct poorly.
//!
//! # Architecture
//! ```text
//! Input (5) -> 16 -> 8 (latent) -> 16 -> Output (5)
//! ```
//!
//! Hidden layers use ReLU, the output layer is linear. Training minimizes the
//! mean squared reconstruction error with Adam over shuffled mini-batches.

use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, Axis, Dimension, Zip};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::AnomalyDetector;
use crate::config::AutoencoderConfig;
use crate::error::{PipelineError, Result};
use crate::types::score::DetectorKind;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-8;

/// Rows per rayon task when scoring in parallel
const SCORE_CHUNK_ROWS: usize = 512;

/// Where batch scoring runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeDevice {
    /// Split batches across the rayon thread pool
    Parallel,
    /// Score on the calling thread
    Sequential,
}

impl ComputeDevice {
    /// Parallel when the rayon pool has more than one worker
    pub fn detect() -> Self {
        if rayon::current_num_threads() > 1 {
            ComputeDevice::Parallel
        } else {
            ComputeDevice::Sequential
        }
    }
}

/// Fully connected layer computing `x · W + b`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// Shape `(fan_in, fan_out)`
    weights: Array2<f64>,
    bias: Array1<f64>,
}

impl DenseLayer {
    fn init<R: Rng>(fan_in: usize, fan_out: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (fan_in as f64).sqrt();
        let weights = Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-bound..bound));
        let bias = Array1::from_shape_fn(fan_out, |_| rng.gen_range(-bound..bound));
        Self { weights, bias }
    }

    fn affine(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        x.dot(&self.weights) + &self.bias
    }

    pub fn input_dim(&self) -> usize {
        self.weights.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.weights.ncols()
    }
}

/// Serialized form of a trained autoencoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoencoderParams {
    pub input_dim: usize,
    pub layers: Vec<DenseLayer>,
}

/// Dense autoencoder scoring rows by reconstruction error
#[derive(Debug, Clone)]
pub struct Autoencoder {
    config: AutoencoderConfig,
    input_dim: usize,
    layers: Vec<DenseLayer>,
    device: ComputeDevice,
}

impl Autoencoder {
    /// Create an untrained autoencoder for `input_dim` features
    pub fn new(config: AutoencoderConfig, input_dim: usize) -> Self {
        Self {
            config,
            input_dim,
            layers: Vec::new(),
            device: ComputeDevice::detect(),
        }
    }

    /// Restore a frozen model, checking it against the expected feature count
    pub fn from_params(params: AutoencoderParams, expected_dim: usize) -> Result<Self> {
        if params.input_dim != expected_dim {
            return Err(PipelineError::ArtifactShapeMismatch {
                expected: expected_dim,
                found: params.input_dim,
            });
        }
        let first = params.layers.first().ok_or(PipelineError::ArtifactShapeMismatch {
            expected: expected_dim,
            found: 0,
        })?;
        if first.input_dim() != expected_dim {
            return Err(PipelineError::ArtifactShapeMismatch {
                expected: expected_dim,
                found: first.input_dim(),
            });
        }

        let mut width = expected_dim;
        for layer in &params.layers {
            if layer.input_dim() != width {
                return Err(PipelineError::ArtifactShapeMismatch {
                    expected: width,
                    found: layer.input_dim(),
                });
            }
            if layer.bias.len() != layer.output_dim() {
                return Err(PipelineError::ArtifactShapeMismatch {
                    expected: layer.output_dim(),
                    found: layer.bias.len(),
                });
            }
            width = layer.output_dim();
        }
        if width != expected_dim {
            return Err(PipelineError::ArtifactShapeMismatch {
                expected: expected_dim,
                found: width,
            });
        }

        let half = params.layers.len() / 2;
        let config = AutoencoderConfig {
            hidden_dims: params.layers[..half].iter().map(DenseLayer::output_dim).collect(),
            ..AutoencoderConfig::default()
        };

        Ok(Self {
            config,
            input_dim: params.input_dim,
            layers: params.layers,
            device: ComputeDevice::detect(),
        })
    }

    /// Snapshot the trained weights
    pub fn params(&self) -> AutoencoderParams {
        AutoencoderParams {
            input_dim: self.input_dim,
            layers: self.layers.clone(),
        }
    }

    pub fn with_device(mut self, device: ComputeDevice) -> Self {
        self.device = device;
        self
    }

    pub fn device(&self) -> ComputeDevice {
        self.device
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn config(&self) -> &AutoencoderConfig {
        &self.config
    }

    /// Layer widths from input to output, e.g. `[5, 16, 8, 16, 5]`
    fn layer_dims(&self) -> Vec<usize> {
        let hidden = &self.config.hidden_dims;
        std::iter::once(self.input_dim)
            .chain(hidden.iter().copied())
            .chain(hidden.iter().rev().skip(1).copied())
            .chain(std::iter::once(self.input_dim))
            .collect()
    }

    fn validate_config(&self) -> Result<()> {
        let config = &self.config;
        if config.hidden_dims.is_empty() || config.hidden_dims.contains(&0) {
            return Err(PipelineError::invalid_parameter(
                "hidden_dims",
                "needs at least one non-zero width",
            ));
        }
        if config.batch_size == 0 {
            return Err(PipelineError::invalid_parameter("batch_size", "must be positive"));
        }
        if !(config.learning_rate > 0.0 && config.learning_rate.is_finite()) {
            return Err(PipelineError::invalid_parameter(
                "learning_rate",
                format!("{} is not a positive step size", config.learning_rate),
            ));
        }
        Ok(())
    }

    /// Train on standardized rows, returning the mean loss of each epoch
    pub fn fit(&mut self, data: ArrayView2<'_, f64>) -> Result<Vec<f64>> {
        self.validate_config()?;
        if data.ncols() != self.input_dim {
            return Err(PipelineError::ArtifactShapeMismatch {
                expected: self.input_dim,
                found: data.ncols(),
            });
        }
        if data.nrows() == 0 {
            return Err(PipelineError::InsufficientData(
                "autoencoder needs at least one training row".into(),
            ));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let dims = self.layer_dims();
        let mut layers: Vec<DenseLayer> = dims
            .windows(2)
            .map(|pair| DenseLayer::init(pair[0], pair[1], &mut rng))
            .collect();
        let mut adam = Adam::new(self.config.learning_rate, &layers);

        let mut order: Vec<usize> = (0..data.nrows()).collect();
        let mut epoch_losses = Vec::with_capacity(self.config.epochs);

        for epoch in 0..self.config.epochs {
            order.shuffle(&mut rng);
            let mut total = 0.0;
            for chunk in order.chunks(self.config.batch_size) {
                let batch = data.select(Axis(0), chunk);
                total += train_step(&mut layers, &mut adam, &batch) * chunk.len() as f64;
            }
            let loss = total / data.nrows() as f64;
            debug!(epoch, loss, "Autoencoder epoch complete");
            epoch_losses.push(loss);
        }

        self.layers = layers;
        info!(
            dims = ?dims,
            epochs = self.config.epochs,
            final_loss = epoch_losses.last().copied().unwrap_or(f64::NAN),
            "Autoencoder trained"
        );
        Ok(epoch_losses)
    }

    /// Frozen forward pass
    pub fn reconstruct(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let last = self.layers.len().saturating_sub(1);
        let mut a = x.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            a = layer.affine(a.view());
            if i != last {
                a.mapv_inplace(relu);
            }
        }
        a
    }

    /// Mean squared reconstruction error per row
    fn reconstruction_errors(&self, x: ArrayView2<'_, f64>) -> Vec<f64> {
        let diff = &x - &self.reconstruct(x);
        diff.mapv(|d| d * d)
            .mean_axis(Axis(1))
            .map(|errors| errors.to_vec())
            .unwrap_or_default()
    }

    fn ensure_ready(&self, width: usize) -> Result<()> {
        if !self.is_trained() {
            return Err(PipelineError::NotTrained {
                detector: "autoencoder",
            });
        }
        if width != self.input_dim {
            return Err(PipelineError::ArtifactShapeMismatch {
                expected: self.input_dim,
                found: width,
            });
        }
        Ok(())
    }
}

impl AnomalyDetector for Autoencoder {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Autoencoder
    }

    fn is_trained(&self) -> bool {
        !self.layers.is_empty()
    }

    fn score(&self, row: ArrayView1<'_, f64>) -> Result<f64> {
        self.ensure_ready(row.len())?;
        let errors = self.reconstruction_errors(row.insert_axis(Axis(0)));
        Ok(errors[0])
    }

    fn score_batch(&self, rows: ArrayView2<'_, f64>) -> Result<Vec<f64>> {
        self.ensure_ready(rows.ncols())?;
        let scores = match self.device {
            ComputeDevice::Parallel => rows
                .axis_chunks_iter(Axis(0), SCORE_CHUNK_ROWS)
                .into_par_iter()
                .map(|chunk| self.reconstruction_errors(chunk))
                .collect::<Vec<_>>()
                .concat(),
            ComputeDevice::Sequential => self.reconstruction_errors(rows),
        };
        Ok(scores)
    }
}

fn relu(z: f64) -> f64 {
    z.max(0.0)
}

/// One optimizer step on `batch`; returns the batch loss before the update
fn train_step(layers: &mut [DenseLayer], adam: &mut Adam, batch: &Array2<f64>) -> f64 {
    let last = layers.len() - 1;

    // Keep each layer's input and pre-activation for backprop
    let mut inputs = Vec::with_capacity(layers.len());
    let mut pre_activations = Vec::with_capacity(layers.len());
    let mut a = batch.clone();
    for (i, layer) in layers.iter().enumerate() {
        let z = layer.affine(a.view());
        let next = if i == last { z.clone() } else { z.mapv(relu) };
        inputs.push(a);
        pre_activations.push(z);
        a = next;
    }

    let diff = &a - batch;
    let loss = diff.mapv(|d| d * d).mean().unwrap_or(0.0);
    let mut grad = diff * (2.0 / batch.len() as f64);

    adam.tick();
    for i in (0..layers.len()).rev() {
        let dz = if i == last {
            grad
        } else {
            Zip::from(&grad)
                .and(&pre_activations[i])
                .map_collect(|&g, &z| if z > 0.0 { g } else { 0.0 })
        };
        let dw = inputs[i].t().dot(&dz);
        let db = dz.sum_axis(Axis(0));
        grad = dz.dot(&layers[i].weights.t());
        adam.update(i, &mut layers[i], &dw, &db);
    }

    loss
}

/// Adam optimizer state for every layer
#[derive(Debug)]
struct Adam {
    learning_rate: f64,
    step: i32,
    moments: Vec<LayerMoments>,
}

#[derive(Debug)]
struct LayerMoments {
    m_w: Array2<f64>,
    v_w: Array2<f64>,
    m_b: Array1<f64>,
    v_b: Array1<f64>,
}

impl Adam {
    fn new(learning_rate: f64, layers: &[DenseLayer]) -> Self {
        let moments = layers
            .iter()
            .map(|layer| LayerMoments {
                m_w: Array2::zeros(layer.weights.raw_dim()),
                v_w: Array2::zeros(layer.weights.raw_dim()),
                m_b: Array1::zeros(layer.bias.raw_dim()),
                v_b: Array1::zeros(layer.bias.raw_dim()),
            })
            .collect();
        Self {
            learning_rate,
            step: 0,
            moments,
        }
    }

    fn tick(&mut self) {
        self.step += 1;
    }

    fn update(&mut self, index: usize, layer: &mut DenseLayer, dw: &Array2<f64>, db: &Array1<f64>) {
        let correction1 = 1.0 - ADAM_BETA1.powi(self.step);
        let correction2 = 1.0 - ADAM_BETA2.powi(self.step);
        let lr = self.learning_rate;
        let moments = &mut self.moments[index];
        adam_update(&mut layer.weights, dw, &mut moments.m_w, &mut moments.v_w, lr, correction1, correction2);
        adam_update(&mut layer.bias, db, &mut moments.m_b, &mut moments.v_b, lr, correction1, correction2);
    }
}

fn adam_update<D: Dimension>(
    param: &mut Array<f64, D>,
    grad: &Array<f64, D>,
    m: &mut Array<f64, D>,
    v: &mut Array<f64, D>,
    lr: f64,
    correction1: f64,
    correction2: f64,
) {
    Zip::from(param)
        .and(grad)
        .and(m)
        .and(v)
        .for_each(|p, &g, m, v| {
            *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
            *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *p -= lr * m_hat / (v_hat.sqrt() + ADAM_EPSILON);
        });
}
