//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph. Every function reads the accumulated gradient of `out`
//! and adds its contribution to the gradients of the operands.

use ndarray::{Array2, Axis, Zip};

use crate::tensor::Tensor;

/// Represents the function in the computation graph
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackpropFunc {
    Add,
    Sub,
    Mul,
    Div,
    MatMul,
    Neg,
    /// Raise to a constant power
    Pow(f32),
    /// Multiply by a constant
    Scale(f32),
    ReLU,
    Sigmoid,
    Tanh,
    Exp,
    Log,
    Sum,
    Mean,
    /// Row-wise softmax
    Softmax,
    /// Row-wise log softmax
    LogSoftmax,
    /// Reshape, gradients are reshaped back to the input shape
    View,
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::Add
            | BackpropFunc::Sub
            | BackpropFunc::Mul
            | BackpropFunc::Div
            | BackpropFunc::MatMul => 2,
            BackpropFunc::Neg
            | BackpropFunc::Pow(_)
            | BackpropFunc::Scale(_)
            | BackpropFunc::ReLU
            | BackpropFunc::Sigmoid
            | BackpropFunc::Tanh
            | BackpropFunc::Exp
            | BackpropFunc::Log
            | BackpropFunc::Sum
            | BackpropFunc::Mean
            | BackpropFunc::Softmax
            | BackpropFunc::LogSoftmax
            | BackpropFunc::View => 1,
        }
    }
}

/// Sums a gradient over the axes along which an operand of `shape` was broadcast
pub(crate) fn unbroadcast(grad: Array2<f32>, shape: (usize, usize)) -> Array2<f32> {
    let mut grad = grad;
    if shape.0 == 1 && grad.nrows() != 1 {
        grad = grad.sum_axis(Axis(0)).insert_axis(Axis(0));
    }
    if shape.1 == 1 && grad.ncols() != 1 {
        grad = grad.sum_axis(Axis(1)).insert_axis(Axis(1));
    }
    grad
}

fn out_grad(out: &Tensor) -> Option<Array2<f32>> {
    out.0.borrow().grad.clone()
}

/// Represents backprop for the operation `in1 + in2 = out`
pub fn add(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    in1.accumulate_grad(unbroadcast(grad.clone(), in1.shape()));
    in2.accumulate_grad(unbroadcast(grad, in2.shape()));
}

/// Represents backprop for the operation `in1 - in2 = out`
pub fn sub(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    in1.accumulate_grad(unbroadcast(grad.clone(), in1.shape()));
    in2.accumulate_grad(unbroadcast(grad.mapv(|g| -g), in2.shape()));
}

/// Represents backprop for the operation `in1 * in2 = out` (elementwise)
pub fn mul(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    let (d1, d2) = {
        let a = in1.0.borrow();
        let b = in2.0.borrow();
        (&grad * &b.data, &grad * &a.data)
    };
    in1.accumulate_grad(unbroadcast(d1, in1.shape()));
    in2.accumulate_grad(unbroadcast(d2, in2.shape()));
}

/// Represents backprop for the operation `in1 / in2 = out` (elementwise)
pub fn div(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    let (d1, d2) = {
        let a = in1.0.borrow();
        let b = in2.0.borrow();
        let d1 = &grad / &b.data;
        let d2 = (&grad * &a.data) / &b.data.mapv(|x| x * x);
        (d1, d2.mapv(|x| -x))
    };
    in1.accumulate_grad(unbroadcast(d1, in1.shape()));
    in2.accumulate_grad(unbroadcast(d2, in2.shape()));
}

/// Represents backprop for the operation `in1 @ in2 = out`
pub fn matmul(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    let (d1, d2) = {
        let a = in1.0.borrow();
        let b = in2.0.borrow();
        (grad.dot(&b.data.t()), a.data.t().dot(&grad))
    };
    in1.accumulate_grad(d1);
    in2.accumulate_grad(d2);
}

/// Represents backprop for the operation `-in = out`
pub fn neg(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    in1.accumulate_grad(grad.mapv(|g| -g));
}

/// Represents backprop for the operation `in^exponent = out`
/// The exponent is a constant, so no gradient flows to it
pub fn pow(in1: &Tensor, exponent: f32, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    let delta = Zip::from(&grad)
        .and(&in1.0.borrow().data)
        .map_collect(|&g, &x| g * exponent * x.powf(exponent - 1.0));
    in1.accumulate_grad(delta);
}

/// Represents backprop for the operation `in * factor = out`
pub fn scale(in1: &Tensor, factor: f32, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    in1.accumulate_grad(grad.mapv(|g| g * factor));
}

/// Represents backprop for the operation `relu(in) = out`
pub fn relu(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    let delta = Zip::from(&grad)
        .and(&in1.0.borrow().data)
        .map_collect(|&g, &x| if x > 0.0 { g } else { 0.0 });
    in1.accumulate_grad(delta);
}

/// Represents backprop for the operation `sigmoid(in) = out`
pub fn sigmoid(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    let delta = Zip::from(&grad)
        .and(&out.0.borrow().data)
        .map_collect(|&g, &s| g * s * (1.0 - s));
    in1.accumulate_grad(delta);
}

/// Represents backprop for the operation `tanh(in) = out`
pub fn tanh(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    let delta = Zip::from(&grad)
        .and(&out.0.borrow().data)
        .map_collect(|&g, &t| g * (1.0 - t * t));
    in1.accumulate_grad(delta);
}

/// Represents backprop for the operation `exp(in) = out`
pub fn exp(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    // d exp(x) / dx = exp(x), which is already stored in `out`
    let delta = &grad * &out.0.borrow().data;
    in1.accumulate_grad(delta);
}

/// Represents backprop for the operation `ln(in) = out`
pub fn log(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    let delta = &grad / &in1.0.borrow().data;
    in1.accumulate_grad(delta);
}

/// Represents backprop for the operation `sum(in) = out`
/// Every element receives the output gradient
pub fn sum(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    in1.accumulate_grad(Array2::from_elem(in1.shape(), grad[[0, 0]]));
}

/// Represents backprop for the operation `mean(in) = out`
pub fn mean(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    let (rows, cols) = in1.shape();
    let n = (rows * cols) as f32;
    in1.accumulate_grad(Array2::from_elem((rows, cols), grad[[0, 0]] / n));
}

/// Represents backprop for the operation `softmax(in) = out` along each row
///
/// For a row `s = softmax(x)`, `dx = s * (g - sum(g * s))`
pub fn softmax(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    let delta = {
        let s = &out.0.borrow().data;
        let dot = (&grad * s).sum_axis(Axis(1)).insert_axis(Axis(1));
        s * &(&grad - &dot)
    };
    in1.accumulate_grad(delta);
}

/// Represents backprop for the operation `log_softmax(in) = out` along each row
///
/// For a row `y = log_softmax(x)`, `dx = g - exp(y) * sum(g)`
pub fn log_softmax(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    let delta = {
        let probs = out.0.borrow().data.mapv(f32::exp);
        let total = grad.sum_axis(Axis(1)).insert_axis(Axis(1));
        &grad - &(&probs * &total)
    };
    in1.accumulate_grad(delta);
}

/// Represents backprop for a reshape, the gradient is laid out in the input shape again
pub fn view(in1: &Tensor, out: &Tensor) {
    let Some(grad) = out_grad(out) else { return };
    match Array2::from_shape_vec(in1.shape(), grad.iter().copied().collect()) {
        Ok(delta) => in1.accumulate_grad(delta),
        Err(e) => log::error!("Failed to reshape gradient of a view: {}", e),
    }
}

/// Applies a backprop function for operators with two operands
pub fn update_gradients_two_operands(in1: &Tensor, in2: &Tensor, out: &Tensor) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::Add) => add(in1, in2, out),
        Some(BackpropFunc::Sub) => sub(in1, in2, out),
        Some(BackpropFunc::Mul) => mul(in1, in2, out),
        Some(BackpropFunc::Div) => div(in1, in2, out),
        Some(BackpropFunc::MatMul) => matmul(in1, in2, out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}

/// Applies a backprop function for operators with one operand
pub fn update_gradients_one_operand(in1: &Tensor, out: &Tensor) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::Neg) => neg(in1, out),
        Some(BackpropFunc::Pow(exponent)) => pow(in1, exponent, out),
        Some(BackpropFunc::Scale(factor)) => scale(in1, factor, out),
        Some(BackpropFunc::ReLU) => relu(in1, out),
        Some(BackpropFunc::Sigmoid) => sigmoid(in1, out),
        Some(BackpropFunc::Tanh) => tanh(in1, out),
        Some(BackpropFunc::Exp) => exp(in1, out),
        Some(BackpropFunc::Log) => log(in1, out),
        Some(BackpropFunc::Sum) => sum(in1, out),
        Some(BackpropFunc::Mean) => mean(in1, out),
        Some(BackpropFunc::Softmax) => softmax(in1, out),
        Some(BackpropFunc::LogSoftmax) => log_softmax(in1, out),
        Some(BackpropFunc::View) => view(in1, out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}
