//! Dense feed-forward network used as the learnable term of a hybrid model.
//!
//! The network only stores its architecture. Weights live in the flat
//! parameter vector owned by the training loop and are read on every call,
//! laid out layer by layer as the row-major weight matrix (`out × in`)
//! followed by the bias vector.

use super::LearnedTerm;
use crate::data::ExperimentContext;
use crate::error::{Result, UdeError};
use crate::traits::Scalar;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Hidden-layer nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Tanh,
    /// Gaussian radial basis `exp(-x²)`.
    Rbf,
    Identity,
}

impl Activation {
    pub fn apply<T: Scalar>(self, x: T) -> T {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::Rbf => (-(x * x)).exp(),
            Activation::Identity => x,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseNetwork {
    widths: Vec<usize>,
    activation: Activation,
}

impl DenseNetwork {
    /// `widths` lists every layer size including input and output, e.g.
    /// `[2, 5, 5, 2]`. Hidden layers use `activation`; the output layer is
    /// linear.
    pub fn new(widths: Vec<usize>, activation: Activation) -> Result<Self> {
        if widths.len() < 2 {
            return Err(UdeError::InvalidSettings(
                "network needs at least an input and an output layer".to_string(),
            ));
        }
        if widths.iter().any(|&w| w == 0) {
            return Err(UdeError::InvalidSettings(
                "network layer widths must be positive".to_string(),
            ));
        }
        Ok(Self { widths, activation })
    }

    pub fn widths(&self) -> &[usize] {
        &self.widths
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    fn layers(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.widths.windows(2).map(|pair| (pair[0], pair[1]))
    }

    /// Glorot-normal weights and zero biases drawn from the experiment RNG.
    pub fn initial_parameters(&self, context: &mut ExperimentContext) -> Vec<f64> {
        let mut params = Vec::with_capacity(LearnedTerm::parameter_count(self));
        for (fan_in, fan_out) in self.layers() {
            let std_dev = (2.0 / (fan_in + fan_out) as f64).sqrt();
            for _ in 0..fan_in * fan_out {
                let z: f64 = context.rng().sample(StandardNormal);
                params.push(std_dev * z);
            }
            params.extend(std::iter::repeat(0.0).take(fan_out));
        }
        params
    }

    /// Evaluates the network into `out`.
    pub fn forward<T: Scalar>(&self, input: &[T], params: &[T], out: &mut [T]) {
        let widest = self.widths.iter().copied().max().unwrap_or(0);
        let mut current: Vec<T> = Vec::with_capacity(widest);
        let mut next: Vec<T> = Vec::with_capacity(widest);
        current.extend_from_slice(input);

        let layer_count = self.widths.len() - 1;
        let mut offset = 0;
        for (layer, (fan_in, fan_out)) in self.layers().enumerate() {
            let weights = &params[offset..offset + fan_in * fan_out];
            let biases = &params[offset + fan_in * fan_out..offset + fan_in * fan_out + fan_out];
            offset += fan_in * fan_out + fan_out;

            next.clear();
            for row in 0..fan_out {
                let mut sum = biases[row];
                for col in 0..fan_in {
                    sum = sum + weights[row * fan_in + col] * current[col];
                }
                if layer + 1 < layer_count {
                    sum = self.activation.apply(sum);
                }
                next.push(sum);
            }
            std::mem::swap(&mut current, &mut next);
        }

        out[..current.len()].copy_from_slice(&current);
    }
}

impl LearnedTerm for DenseNetwork {
    fn input_dimension(&self) -> usize {
        self.widths[0]
    }

    fn output_dimension(&self) -> usize {
        self.widths[self.widths.len() - 1]
    }

    fn parameter_count(&self) -> usize {
        self.layers().map(|(i, o)| i * o + o).sum()
    }

    fn accumulate<T: Scalar>(&self, x: &[T], p: &[T], out: &mut [T]) {
        let mut output = vec![T::zero(); self.output_dimension()];
        self.forward(x, p, &mut output);
        for (o, u) in out.iter_mut().zip(output) {
            *o = *o + u;
        }
    }
}
