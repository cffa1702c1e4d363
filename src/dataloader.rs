//! Data loader

use std::cell::RefCell;

use ndarray::{Array2, Axis};
use rand::{SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::tensor::Tensor;

/// Errors for the dataloader
#[derive(Debug, Error, PartialEq)]
pub enum DataLoaderError {
    #[error("Got {label_len} labels for {data_len} samples, the lengths must match")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Batch size must be at least 1")]
    ZeroBatchSize,
}

/// Data loader, returns batches of samples and class labels optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    // one sample per row
    inputs: Array2<f32>,
    labels: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    rng: RefCell<Pcg64Mcg>,
}

impl DataLoader {
    pub fn new(
        inputs: Array2<f32>,
        labels: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if inputs.nrows() != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: inputs.nrows(),
            });
        }
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        Ok(Self {
            inputs,
            labels,
            batch_size,
            shuffle,
            rng: RefCell::new(Pcg64Mcg::from_rng(&mut rand::rng())),
        })
    }

    /// Makes the shuffling order reproducible
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = RefCell::new(Pcg64Mcg::seed_from_u64(seed));
        self
    }

    pub fn n_samples(&self) -> usize {
        self.labels.len()
    }

    /// Number of batches per epoch, the last one may be smaller than the batch size
    pub fn n_batches(&self) -> usize {
        self.n_samples().div_ceil(self.batch_size)
    }

    /// Starts a new epoch, reshuffling the samples if enabled
    pub fn iter(&self) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.n_samples()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(&mut *self.rng.borrow_mut());
        }
        DataLoaderIterator {
            inputs: &self.inputs,
            labels: &self.labels,
            batch_size: self.batch_size,
            indices,
            curr_iter: 0,
        }
    }
}

impl<'a> IntoIterator for &'a DataLoader {
    type Item = (Tensor, Vec<usize>);
    type IntoIter = DataLoaderIterator<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// An iterator which returns mini batches of samples and labels until the end of the dataset
pub struct DataLoaderIterator<'a> {
    inputs: &'a Array2<f32>,
    labels: &'a [usize],
    batch_size: usize,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = (Tensor, Vec<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let end = (self.curr_iter + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.curr_iter..end];
        let batch_inputs = self.inputs.select(Axis(0), batch_indices);
        let batch_labels = batch_indices.iter().map(|&i| self.labels[i]).collect();
        self.curr_iter = end;
        Some((Tensor::new(batch_inputs), batch_labels))
    }
}
