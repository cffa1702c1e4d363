//! Components to build a neural network

use std::{
    fmt::{self, Display},
    sync::atomic::{self, AtomicUsize},
};

use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

use crate::tensor::{Tensor, TensorError};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch, expected {expected} features but got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    fn parameters(&self) -> Vec<Tensor>;
    /// Forward pass over a batch, one sample per row
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError>;
    /// Short description used when printing a model
    fn describe(&self) -> String;
}

/// A fully connected layer computing `x @ W + b`
pub struct Linear {
    /// weights of shape `(in_features, out_features)`
    pub weight: Tensor,
    /// bias of shape `(1, out_features)`, broadcast over the batch
    pub bias: Tensor,
    n_output_nans: AtomicUsize,
    n_parameters_nans: AtomicUsize,
}

impl Linear {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self::with_rng(in_features, out_features, &mut rand::rng())
    }

    /// Creates a new layer drawing its initial parameters from `rng`
    pub fn with_rng<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        // He initialization to ensure the variance of the output is the same as the input
        // and keep weights relatively small to avoid exploding or vanishing gradients
        let std = (2.0 / in_features.max(1) as f32).sqrt();
        let normal = Normal::new(0.0, std).expect("std is finite and positive");
        let weight = Array2::from_shape_simple_fn((in_features, out_features), || {
            normal.sample(&mut *rng)
        });
        Self {
            weight: Tensor::parameter(weight),
            bias: Tensor::parameter(Array2::zeros((1, out_features))),
            n_output_nans: AtomicUsize::new(0),
            n_parameters_nans: AtomicUsize::new(0),
        }
    }

    // Testing utility for a deterministic and simple layer
    #[cfg(test)]
    fn new_ones(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: Tensor::parameter(Array2::ones((in_features, out_features))),
            bias: Tensor::parameter(Array2::ones((1, out_features))),
            n_output_nans: AtomicUsize::new(0),
            n_parameters_nans: AtomicUsize::new(0),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape().0
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape().1
    }

    /// Number of NaN outputs seen in the last forward pass (used for debugging)
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let got = input.shape().1;
        if got != self.in_features() {
            return Err(NNError::InputSizeMismatch {
                expected: self.in_features(),
                got,
            });
        }
        let output = input.matmul(&self.weight)?.try_add(&self.bias)?;

        let n_output_nans = output.data_ref().iter().filter(|v| v.is_nan()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        let n_parameters_nans: usize = self
            .parameters()
            .iter()
            .map(|p| p.data_ref().iter().filter(|v| v.is_nan()).count())
            .sum();
        self.n_parameters_nans
            .store(n_parameters_nans, atomic::Ordering::Relaxed);
        if n_output_nans > 0 || n_parameters_nans > 0 {
            log::debug!(
                "n_output_nans: {}, n_parameters_nans: {}",
                n_output_nans,
                n_parameters_nans
            );
        }
        Ok(output)
    }

    fn describe(&self) -> String {
        format!(
            "Linear(in_features={}, out_features={}, bias=True)",
            self.in_features(),
            self.out_features()
        )
    }
}

/// Applies ReLU elementwise, works for arbitrary shapes
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    /// Returns the number of inactive units in the last batch (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

impl Module for ReLU {
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let n_dead_neurons = input.data_ref().iter().filter(|v| **v <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        Ok(input.relu())
    }

    fn describe(&self) -> String {
        "ReLU()".to_string()
    }
}

#[derive(Default)]
pub struct Sigmoid;

impl Module for Sigmoid {
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok(input.sigmoid())
    }

    fn describe(&self) -> String {
        "Sigmoid()".to_string()
    }
}

#[derive(Default)]
pub struct Tanh;

impl Module for Tanh {
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok(input.tanh())
    }

    fn describe(&self) -> String {
        "Tanh()".to_string()
    }
}

/// Applies softmax over each row
#[derive(Default)]
pub struct Softmax;

impl Module for Softmax {
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        // Note: logits are shifted by their row maximum before exponentiating, large
        // activations would otherwise overflow to `inf` and produce NaN probabilities
        Ok(input.softmax())
    }

    fn describe(&self) -> String {
        "Softmax(dim=1)".to_string()
    }
}

/// Applies log softmax over each row, pairs with [`crate::loss::NLLLoss`]
#[derive(Default)]
pub struct LogSoftmax;

impl Module for LogSoftmax {
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok(input.log_softmax())
    }

    fn describe(&self) -> String {
        "LogSoftmax(dim=1)".to_string()
    }
}

/// Chains modules, feeding the output of each into the next
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self { layers: vec![] }
    }

    /// Appends a layer, builder style
    pub fn add(mut self, layer: impl Module + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        self.layers
            .iter()
            .try_fold(input.clone(), |x, layer| layer.forward(&x))
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl Display for Sequential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sequential(")?;
        for (i, layer) in self.layers.iter().enumerate() {
            writeln!(f, "  ({}): {}", i, layer.describe())?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_layer_forward() {
        let layer = Linear::new_ones(2, 3);
        let inputs = Tensor::new(array![[1.0, 2.0], [0.0, 0.0]]);
        let outputs = layer.forward(&inputs).unwrap();
        assert_eq!(outputs.shape(), (2, 3));
        assert_eq!(outputs.data(), array![[4.0, 4.0, 4.0], [1.0, 1.0, 1.0]]);
        assert_eq!(layer.n_output_nans(), 0);
    }

    #[test]
    fn test_layer_backward() {
        let layer = Linear::new_ones(2, 1);
        let inputs = Tensor::new(array![[1.0, 2.0], [3.0, 4.0]]);
        let outputs = layer.forward(&inputs).unwrap();
        outputs.sum().backward().unwrap();

        // d sum / dW = column sums of the input, d sum / db = batch size
        assert_eq!(layer.weight.grad().unwrap(), array![[4.0], [6.0]]);
        assert_eq!(layer.bias.grad().unwrap(), array![[2.0]]);
        // inputs do not track gradients
        assert!(inputs.grad().is_none());
    }

    #[test]
    fn test_dim_mismatch() {
        let layer = Linear::new_ones(2, 3);
        let inputs = Tensor::new(array![[1.0]]);
        let outputs = layer.forward(&inputs).unwrap_err();
        assert!(matches!(
            outputs,
            NNError::InputSizeMismatch {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn test_seeded_init() {
        let a = Linear::with_rng(784, 128, &mut Pcg64Mcg::seed_from_u64(7));
        let b = Linear::with_rng(784, 128, &mut Pcg64Mcg::seed_from_u64(7));
        assert_eq!(a.weight, b.weight);
        assert_eq!(a.weight.shape(), (784, 128));
        assert_eq!(a.bias.shape(), (1, 128));
        // He init keeps the weights around N(0, 2 / fan_in)
        let mean = a.weight.data().mean().unwrap();
        assert!(mean.abs() < 0.01);
    }

    #[test]
    fn test_relu_counts_dead_neurons() {
        let relu = ReLU::new();
        let out = relu
            .forward(&Tensor::new(array![[-1.0, 0.0, 2.0]]))
            .unwrap();
        assert_eq!(out.data(), array![[0.0, 0.0, 2.0]]);
        assert_eq!(relu.n_dead_neurons(), 2);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let out = Softmax
            .forward(&Tensor::new(array![[1.0, 2.0, 3.0], [-5.0, 0.0, 5.0]]))
            .unwrap();
        for row in out.data().rows() {
            assert_eq_float!(row.sum(), 1.0);
        }
        let log_out = LogSoftmax
            .forward(&Tensor::new(array![[1.0, 2.0]]))
            .unwrap();
        assert_eq_float!(log_out.data()[[0, 1]].exp(), 0.7310585);
    }

    #[test]
    fn test_sequential() {
        let model = Sequential::new()
            .add(Linear::new(4, 3))
            .add(ReLU::new())
            .add(Linear::new(3, 2))
            .add(LogSoftmax);
        assert_eq!(model.len(), 4);
        // two weights and two biases
        assert_eq!(model.parameters().len(), 4);

        let out = model.forward(&Tensor::zeros((5, 4))).unwrap();
        assert_eq!(out.shape(), (5, 2));

        assert_eq!(
            model.to_string(),
            "Sequential(\n  (0): Linear(in_features=4, out_features=3, bias=True)\n  (1): ReLU()\n  (2): Linear(in_features=3, out_features=2, bias=True)\n  (3): LogSoftmax(dim=1)\n)"
        );
    }

    #[test]
    fn test_zero_grad() {
        let mut layer = Linear::new_ones(2, 1);
        let out = layer.forward(&Tensor::new(array![[1.0, 1.0]])).unwrap();
        out.sum().backward().unwrap();
        assert!(layer.weight.grad().is_some());

        layer.zero_grad();
        assert!(layer.weight.grad().is_none());
        assert!(layer.bias.grad().is_none());
    }
}
