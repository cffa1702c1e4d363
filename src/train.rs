//! Training and evaluation loops
//!
//! One call of [`train_epoch`] is one pass over the training set: for every mini batch the
//! gradients are reset, the model runs forward, the loss is backpropagated and the
//! optimizer takes a step.

use ndarray::Array2;
use thiserror::Error;

use crate::{
    dataloader::DataLoader,
    loss::{Criterion, LossError},
    nn::{Module, NNError},
    optim::Optim,
    tensor::{Tensor, TensorError, no_grad},
};

/// Errors for the training loop
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    NN(#[from] NNError),
    #[error(transparent)]
    Loss(#[from] LossError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("The data loader yielded no samples")]
    EmptyLoader,
}

/// Metrics over one pass of a data loader
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    /// mean loss per sample
    pub loss: f32,
    /// fraction of samples whose highest scoring class is the label
    pub accuracy: f32,
    pub n_samples: usize,
}

#[derive(Default)]
struct Accumulator {
    loss: f32,
    correct: usize,
    n_samples: usize,
}

impl Accumulator {
    fn add(&mut self, output: &Tensor, labels: &[usize], loss: f32) {
        self.loss += loss * labels.len() as f32;
        self.correct += output
            .argmax_rows()
            .iter()
            .zip(labels)
            .filter(|(pred, label)| pred == label)
            .count();
        self.n_samples += labels.len();
    }

    fn finish(self) -> Result<EpochStats, TrainError> {
        if self.n_samples == 0 {
            return Err(TrainError::EmptyLoader);
        }
        let n = self.n_samples as f32;
        Ok(EpochStats {
            loss: self.loss / n,
            accuracy: self.correct as f32 / n,
            n_samples: self.n_samples,
        })
    }
}

/// Runs one epoch of mini batch gradient descent
pub fn train_epoch(
    model: &dyn Module,
    criterion: Criterion,
    optim: &mut dyn Optim,
    loader: &DataLoader,
) -> Result<EpochStats, TrainError> {
    let mut acc = Accumulator::default();
    for (inputs, labels) in loader {
        optim.zero_grad();
        let output = model.forward(&inputs)?;
        let loss = criterion.compute(&output, &labels)?;
        loss.backward()?;
        optim.step();
        acc.add(&output, &labels, loss.item());
    }
    acc.finish()
}

/// Computes loss and accuracy without recording a computation graph
pub fn evaluate(
    model: &dyn Module,
    criterion: Criterion,
    loader: &DataLoader,
) -> Result<EpochStats, TrainError> {
    no_grad(|| {
        let mut acc = Accumulator::default();
        for (inputs, labels) in loader {
            let output = model.forward(&inputs)?;
            let loss = criterion.compute(&output, &labels)?;
            acc.add(&output, &labels, loss.item());
        }
        acc.finish()
    })
}

/// Class probabilities for a single sample given as a `(1, n_features)` matrix
pub fn predict(
    model: &dyn Module,
    criterion: Criterion,
    input: Array2<f32>,
) -> Result<Vec<f32>, TrainError> {
    no_grad(|| {
        let output = model.forward(&Tensor::new(input))?;
        let probs = criterion.probabilities(&output);
        Ok(probs.data().iter().copied().collect())
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::{
        assert_eq_float,
        datasets::gen_linear_data,
        nn::{Linear, LogSoftmax, ReLU, Sequential},
        optim::{Adam, SGD},
    };

    use super::*;

    fn model(rng: &mut Pcg64Mcg) -> Sequential {
        Sequential::new()
            .add(Linear::with_rng(2, 16, &mut *rng))
            .add(ReLU::new())
            .add(Linear::with_rng(16, 2, &mut *rng))
    }

    #[test]
    fn test_training_lowers_loss() {
        let mut rng = Pcg64Mcg::seed_from_u64(11);
        let data = gen_linear_data(200, &mut rng);
        let loader = DataLoader::new(data.inputs, data.labels, 20, true)
            .unwrap()
            .with_seed(5);
        let model = model(&mut rng);
        let mut optim = SGD::new(model.parameters(), 0.01, 0.9);

        let first = train_epoch(&model, Criterion::CrossEntropy, &mut optim, &loader).unwrap();
        assert_eq!(first.n_samples, 200);
        let mut last = first;
        for _ in 0..30 {
            last = train_epoch(&model, Criterion::CrossEntropy, &mut optim, &loader).unwrap();
        }
        assert!(last.loss < first.loss, "{:?} vs {:?}", last, first);
        assert!(last.accuracy > 0.85, "{:?}", last);

        let eval = evaluate(&model, Criterion::CrossEntropy, &loader).unwrap();
        assert!(eval.accuracy > 0.85, "{:?}", eval);
    }

    #[test]
    fn test_nll_head_with_adam() {
        let mut rng = Pcg64Mcg::seed_from_u64(12);
        let data = gen_linear_data(100, &mut rng);
        let loader = DataLoader::new(data.inputs, data.labels, 10, false).unwrap();
        let model = model(&mut rng).add(LogSoftmax);
        let mut optim = Adam::new(model.parameters(), 0.01);

        let first = train_epoch(&model, Criterion::Nll, &mut optim, &loader).unwrap();
        let mut last = first;
        for _ in 0..20 {
            last = train_epoch(&model, Criterion::Nll, &mut optim, &loader).unwrap();
        }
        assert!(last.loss < first.loss, "{:?} vs {:?}", last, first);
    }

    #[test]
    fn test_evaluate_records_no_graph() {
        let mut rng = Pcg64Mcg::seed_from_u64(13);
        let data = gen_linear_data(10, &mut rng);
        let loader = DataLoader::new(data.inputs, data.labels, 4, false).unwrap();
        let model = model(&mut rng);

        let stats = evaluate(&model, Criterion::CrossEntropy, &loader).unwrap();
        assert_eq!(stats.n_samples, 10);
        assert!(model.parameters().iter().all(|p| p.grad().is_none()));
    }

    #[test]
    fn test_predict_probabilities() {
        let mut rng = Pcg64Mcg::seed_from_u64(14);
        let model = model(&mut rng);
        let input = Array2::from_elem((1, 2), 1.0);
        let probs = predict(&model, Criterion::CrossEntropy, input).unwrap();
        assert_eq!(probs.len(), 2);
        assert_eq_float!(probs.iter().sum::<f32>(), 1.0);
    }

    #[test]
    fn test_empty_loader() {
        let loader = DataLoader::new(Array2::zeros((0, 2)), vec![], 4, false).unwrap();
        let model = model(&mut Pcg64Mcg::seed_from_u64(15));
        let mut optim = SGD::new(model.parameters(), 0.1, 0.0);
        assert!(matches!(
            train_epoch(&model, Criterion::CrossEntropy, &mut optim, &loader),
            Err(TrainError::EmptyLoader)
        ));
    }
}
