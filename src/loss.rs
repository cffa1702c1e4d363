//! Loss functions

use clap::ValueEnum;
use ndarray::Array2;
use thiserror::Error;

use crate::tensor::{Tensor, TensorError};

/// Errors for the loss functions
#[derive(Debug, Error, PartialEq)]
pub enum LossError {
    #[error("Got {targets} targets for a batch of {batch} predictions")]
    BatchSizeMismatch { batch: usize, targets: usize },
    #[error("Target class {target} is out of range for {n_classes} classes")]
    TargetOutOfRange { target: usize, n_classes: usize },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Mean Squared Error Loss between two tensors of the same shape
pub struct MSELoss;

impl MSELoss {
    pub fn call(y_pred: &Tensor, y_true: &Tensor) -> Result<Tensor, LossError> {
        let (lhs, rhs) = (y_pred.shape(), y_true.shape());
        if lhs != rhs {
            return Err(TensorError::ShapeMismatch {
                op: "mse_loss",
                lhs,
                rhs,
            }
            .into());
        }
        Ok(y_pred.try_sub(y_true)?.pow(2.0).mean())
    }
}

/// Negative log likelihood loss, expects log probabilities (e.g. from `LogSoftmax`)
/// and the index of the target class for every row
pub struct NLLLoss;

impl NLLLoss {
    pub fn call(log_probs: &Tensor, targets: &[usize]) -> Result<Tensor, LossError> {
        let (batch, n_classes) = log_probs.shape();
        let one_hot = one_hot(targets, batch, n_classes)?;
        // picks -log p(target) of each row, averaged over the batch
        let picked = log_probs.try_mul(&Tensor::new(one_hot))?;
        Ok(picked.sum().scale(-1.0 / batch as f32))
    }
}

/// Cross entropy loss over raw logits, combines log softmax and [`NLLLoss`]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn call(logits: &Tensor, targets: &[usize]) -> Result<Tensor, LossError> {
        NLLLoss::call(&logits.log_softmax(), targets)
    }
}

/// One-hot encodes class indices into a `(batch, n_classes)` matrix
pub fn one_hot(
    targets: &[usize],
    batch: usize,
    n_classes: usize,
) -> Result<Array2<f32>, LossError> {
    if targets.len() != batch {
        return Err(LossError::BatchSizeMismatch {
            batch,
            targets: targets.len(),
        });
    }
    let mut encoded = Array2::zeros((batch, n_classes));
    for (row, &target) in targets.iter().enumerate() {
        if target >= n_classes {
            return Err(LossError::TargetOutOfRange { target, n_classes });
        }
        encoded[[row, target]] = 1.0;
    }
    Ok(encoded)
}

/// Selects the loss used by the training loop, together with the output head the
/// model needs in front of it
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    /// Raw logits with [`CrossEntropyLoss`]
    CrossEntropy,
    /// `LogSoftmax` output with [`NLLLoss`]
    Nll,
    /// `Softmax` output with [`MSELoss`] against one-hot targets
    Mse,
}

impl Criterion {
    /// Computes the loss of a batch of model outputs against class targets
    pub fn compute(&self, output: &Tensor, targets: &[usize]) -> Result<Tensor, LossError> {
        match self {
            Criterion::CrossEntropy => CrossEntropyLoss::call(output, targets),
            Criterion::Nll => NLLLoss::call(output, targets),
            Criterion::Mse => {
                let (batch, n_classes) = output.shape();
                let one_hot = Tensor::new(one_hot(targets, batch, n_classes)?);
                MSELoss::call(output, &one_hot)
            }
        }
    }

    /// Converts model outputs into class probabilities
    pub fn probabilities(&self, output: &Tensor) -> Tensor {
        match self {
            Criterion::CrossEntropy => output.softmax(),
            Criterion::Nll => output.exp(),
            Criterion::Mse => output.clone(),
        }
    }
}
