//! A minimal library for training feed-forward classifiers
//! using PyTorch-like API.

pub mod backprop_fns;
pub mod dataloader;
pub mod datasets;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod tensor;
pub mod train;
