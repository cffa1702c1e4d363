//! Optimizer(s)

use clap::ValueEnum;
use ndarray::{Array2, Zip};

use crate::tensor::Tensor;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
}

/// Optimizer choices exposed on the command line
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum OptimKind {
    Sgd,
    Adam,
}

/// SGD with momentum
pub struct SGD {
    params: Vec<Tensor>,
    // currently does not change the learning rate based on the iteration
    lr: f32,
    momentum: f32,
    // velocity per parameter
    velocity: Vec<Array2<f32>>,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f32, momentum: f32) -> Self {
        let velocity = params.iter().map(|p| Array2::zeros(p.shape())).collect();
        Self {
            params,
            lr,
            momentum,
            velocity,
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[Array2<f32>] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        for (param, velocity) in self.params.iter().zip(self.velocity.iter_mut()) {
            // parameters which took no part in the last backward pass keep their values
            let Some(grad) = param.grad() else { continue };
            // v = momentum * v - lr * grad, p = p + v
            Zip::from(&mut *velocity)
                .and(&grad)
                .for_each(|v, &g| *v = self.momentum * *v - self.lr * g);
            *param.data_mut() += &*velocity;
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }
}

/// Adam with bias corrected moment estimates
/// <https://pytorch.org/docs/stable/generated/torch.optim.Adam.html>
pub struct Adam {
    params: Vec<Tensor>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    // first and second moment estimates per parameter
    m: Vec<Array2<f32>>,
    v: Vec<Array2<f32>>,
    t: i32,
}

impl Adam {
    pub fn new(params: Vec<Tensor>, lr: f32) -> Self {
        Self::with_betas(params, lr, 0.9, 0.999)
    }

    pub fn with_betas(params: Vec<Tensor>, lr: f32, beta1: f32, beta2: f32) -> Self {
        let zeros = |p: &Tensor| Array2::<f32>::zeros(p.shape());
        let m = params.iter().map(zeros).collect();
        let v = params.iter().map(zeros).collect();
        Self {
            params,
            lr,
            beta1,
            beta2,
            eps: 1e-8,
            m,
            v,
            t: 0,
        }
    }
}

impl Optim for Adam {
    fn step(&mut self) {
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);
        let (beta1, beta2, lr, eps) = (self.beta1, self.beta2, self.lr, self.eps);

        for ((param, m), v) in self.params.iter().zip(self.m.iter_mut()).zip(self.v.iter_mut()) {
            let Some(grad) = param.grad() else { continue };
            let mut data = param.data_mut();
            Zip::from(&mut *data)
                .and(&mut *m)
                .and(&mut *v)
                .and(&grad)
                .for_each(|p, m, v, &g| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_sgd_no_momentum() {
        let a = Tensor::parameter(array![[1.0, 2.0]]);
        let c = a.sum();
        c.backward().unwrap();

        let mut optim = SGD::new(vec![a.clone()], 0.1, 0.0);
        optim.step();
        assert_eq!(a.grad().unwrap(), array![[1.0, 1.0]]);
        assert_eq!(a.data(), array![[0.9, 1.9]]);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let a = Tensor::parameter(array![[1.0, 2.0]]);
        let c = a.sum();
        c.backward().unwrap();

        let mut optim = SGD::new(vec![a.clone()], 0.1, 0.9);
        optim.step();
        assert_eq!(a.data(), array![[0.9, 1.9]]);
        assert_eq!(optim.velocities()[0], array![[-0.1, -0.1]]);
        // same gradient again, the velocity builds up
        optim.step();
        let data = a.data();
        assert_eq_float!(data[[0, 0]], 0.71);
        assert_eq_float!(data[[0, 1]], 1.71);
        let velocity = &optim.velocities()[0];
        assert_eq_float!(velocity[[0, 0]], -0.19);
    }

    #[test]
    fn test_sgd_skips_params_without_grad() {
        let a = Tensor::parameter(array![[1.0]]);
        let mut optim = SGD::new(vec![a.clone()], 0.1, 0.9);
        optim.step();
        assert_eq!(a.data(), array![[1.0]]);
    }

    #[test]
    fn test_zero_grad() {
        let a = Tensor::parameter(array![[1.0]]);
        a.exp().backward().unwrap();
        let mut optim = SGD::new(vec![a.clone()], 0.1, 0.0);
        optim.zero_grad();
        assert!(a.grad().is_none());
    }

    #[test]
    fn test_adam_first_step() {
        let a = Tensor::parameter(array![[1.0, -1.0]]);
        // gradients of opposite sign and different magnitude
        let c = (&a * &Tensor::new(array![[3.0, -0.5]])).sum();
        c.backward().unwrap();

        let mut optim = Adam::new(vec![a.clone()], 0.01);
        optim.step();
        // the first bias corrected step moves every parameter by lr against its gradient sign
        let data = a.data();
        assert_eq_float!(data[[0, 0]], 0.99);
        assert_eq_float!(data[[0, 1]], -0.99);
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        let a = Tensor::parameter(array![[5.0]]);
        let mut optim = Adam::new(vec![a.clone()], 0.1);
        for _ in 0..500 {
            optim.zero_grad();
            a.pow(2.0).sum().backward().unwrap();
            optim.step();
        }
        assert!(a.data()[[0, 0]].abs() < 0.1);
    }
}
