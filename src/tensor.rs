//! Two dimensional tensors which form a computation graph
//!
//! A [`Tensor`] is a shared handle to a matrix of `f32`. Operations on tensors which track
//! gradients record the operation and its operands, so that calling [`Tensor::backward`] on a
//! scalar result propagates gradients back to every tensor it was computed from.
use std::{
    cell::{Cell, Ref, RefCell, RefMut},
    collections::HashSet,
    fmt::{self, Debug, Display},
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use ndarray::{Array2, Axis};
use thiserror::Error;

use crate::backprop_fns::{
    BackpropFunc, update_gradients_one_operand, update_gradients_two_operands,
};

type SharedTensor = Rc<RefCell<InnerTensor>>;

/// Errors for tensor operations
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("Shapes {lhs:?} and {rhs:?} are incompatible for {op}")]
    ShapeMismatch {
        op: &'static str,
        lhs: (usize, usize),
        rhs: (usize, usize),
    },
    #[error("Cannot view a tensor of shape {from:?} as {to:?}")]
    InvalidView {
        from: (usize, usize),
        to: (usize, usize),
    },
    #[error("Gradients can only be implicitly created for scalar outputs, got shape {shape:?}")]
    NonScalarBackward { shape: (usize, usize) },
    #[error("Tensor does not require grad and has no backprop function")]
    NoGradient,
}

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Returns whether operations currently record a computation graph on this thread
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

/// Runs `f` without recording a computation graph, e.g. for inference
///
/// Tensors created inside the closure never track gradients. The previous mode is
/// restored when the closure returns or unwinds.
pub fn no_grad<T>(f: impl FnOnce() -> T) -> T {
    struct Restore(bool);

    impl Drop for Restore {
        fn drop(&mut self) {
            GRAD_ENABLED.with(|enabled| enabled.set(self.0));
        }
    }

    let _restore = Restore(GRAD_ENABLED.with(|enabled| enabled.replace(false)));
    f()
}

/// Returns the shape two operands broadcast to, if any
fn broadcast_shape(lhs: (usize, usize), rhs: (usize, usize)) -> Option<(usize, usize)> {
    fn dim(a: usize, b: usize) -> Option<usize> {
        match (a, b) {
            _ if a == b => Some(a),
            (1, _) => Some(b),
            (_, 1) => Some(a),
            _ => None,
        }
    }
    Some((dim(lhs.0, rhs.0)?, dim(lhs.1, rhs.1)?))
}

/// Newtype representing a shared tensor in a computation graph
#[derive(Debug, Clone)]
pub struct Tensor(pub(crate) SharedTensor);

impl Tensor {
    /// Create a new tensor which does not track gradients
    pub fn new(data: Array2<f32>) -> Self {
        Self(Rc::new(RefCell::new(InnerTensor::new(data, false))))
    }

    /// Create a new leaf tensor which tracks gradients, e.g. a model weight
    pub fn parameter(data: Array2<f32>) -> Self {
        Self(Rc::new(RefCell::new(InnerTensor::new(data, true))))
    }

    /// Create a tensor from a row-major vector
    pub fn from_vec(shape: (usize, usize), data: Vec<f32>) -> Result<Self, TensorError> {
        let len = data.len();
        Array2::from_shape_vec(shape, data)
            .map(Self::new)
            .map_err(|_| TensorError::InvalidView {
                from: (1, len),
                to: shape,
            })
    }

    pub fn zeros(shape: (usize, usize)) -> Self {
        Self::new(Array2::zeros(shape))
    }

    /// A 1x1 tensor
    pub fn scalar(value: f32) -> Self {
        Self::new(Array2::from_elem((1, 1), value))
    }

    /// Turns on gradient tracking for this tensor
    pub fn requires_grad_(self) -> Self {
        self.0.borrow_mut().requires_grad = true;
        self
    }

    /// Create a new tensor derived from an operation on other tensors (i.e. not a leaf node)
    ///
    /// The graph edge is only recorded when gradient mode is enabled and an operand tracks
    /// gradients, otherwise the result is a plain constant.
    fn new_derived(data: Array2<f32>, backprop_fn: BackpropFunc, operands: &[&Tensor]) -> Self {
        let track = is_grad_enabled() && operands.iter().any(|t| t.requires_grad());
        let mut inner = InnerTensor::new(data, track);
        if track {
            debug_assert_eq!(backprop_fn.n_operands(), operands.len());
            inner.backprop_fn = Some(backprop_fn);
            inner.children = operands.iter().map(|t| t.0.clone()).collect();
        }
        Self(Rc::new(RefCell::new(inner)))
    }

    /// Returns an owned copy of the underlying data
    pub fn data(&self) -> Array2<f32> {
        self.0.borrow().data.clone()
    }

    pub fn data_ref(&self) -> Ref<'_, Array2<f32>> {
        Ref::map(self.0.borrow(), |inner| &inner.data)
    }

    /// Mutable access to the data, used by optimizers to update parameters in place
    pub fn data_mut(&self) -> RefMut<'_, Array2<f32>> {
        RefMut::map(self.0.borrow_mut(), |inner| &mut inner.data)
    }

    /// Accumulated gradient, `None` until a backward pass reaches this tensor
    pub fn grad(&self) -> Option<Array2<f32>> {
        self.0.borrow().grad.clone()
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    pub fn shape(&self) -> (usize, usize) {
        self.0.borrow().data.dim()
    }

    /// Returns the first element, intended for 1x1 tensors such as a loss
    pub fn item(&self) -> f32 {
        self.0.borrow().data.iter().next().copied().unwrap_or(f32::NAN)
    }

    pub(crate) fn accumulate_grad(&self, delta: Array2<f32>) {
        let mut inner = self.0.borrow_mut();
        if !inner.requires_grad {
            return;
        }
        match &mut inner.grad {
            Some(grad) => *grad += &delta,
            slot => *slot = Some(delta),
        }
    }

    fn id(&self) -> u64 {
        self.0.borrow().id
    }

    /// Clears the gradient of this tensor and of every tensor it was computed from
    pub fn zero_grad(&mut self) {
        let mut order = vec![];
        let mut visited = HashSet::new();
        self.topological_order(&mut order, &mut visited);
        for tensor in order {
            tensor.0.borrow_mut().grad = None;
        }
    }

    /// Backpropagates from this scalar tensor through the computation graph
    pub fn backward(&self) -> Result<(), TensorError> {
        let shape = self.shape();
        if shape != (1, 1) {
            return Err(TensorError::NonScalarBackward { shape });
        }
        if !self.requires_grad() {
            return Err(TensorError::NoGradient);
        }
        // d out / d out = 1
        self.0.borrow_mut().grad = Some(Array2::ones((1, 1)));

        let mut order = vec![];
        let mut visited = HashSet::new();
        // visit in post order
        self.topological_order(&mut order, &mut visited);

        // apply backprop, reversed to start from the root
        for tensor in order.into_iter().rev() {
            let children = tensor.0.borrow().children.clone();
            match children.as_slice() {
                [] => {}
                [in1] => update_gradients_one_operand(&Tensor(in1.clone()), &tensor),
                [in1, in2] => update_gradients_two_operands(
                    &Tensor(in1.clone()),
                    &Tensor(in2.clone()),
                    &tensor,
                ),
                _ => panic!("Unsupported number of operands: {}", children.len()),
            }
        }
        Ok(())
    }

    fn topological_order(&self, order: &mut Vec<Tensor>, visited: &mut HashSet<u64>) {
        if !visited.insert(self.id()) {
            return;
        }
        for child in self.0.borrow().children.iter() {
            Tensor(child.clone()).topological_order(order, visited);
        }
        order.push(self.clone());
    }
}

// Various operations on tensors
impl Tensor {
    fn elementwise(
        &self,
        other: &Tensor,
        op: &'static str,
        backprop_fn: BackpropFunc,
        f: impl Fn(&Array2<f32>, &Array2<f32>) -> Array2<f32>,
    ) -> Result<Tensor, TensorError> {
        let (lhs, rhs) = (self.shape(), other.shape());
        if broadcast_shape(lhs, rhs).is_none() {
            return Err(TensorError::ShapeMismatch { op, lhs, rhs });
        }
        let data = f(&self.0.borrow().data, &other.0.borrow().data);
        Ok(Tensor::new_derived(data, backprop_fn, &[self, other]))
    }

    fn unary(
        &self,
        backprop_fn: BackpropFunc,
        f: impl FnOnce(&Array2<f32>) -> Array2<f32>,
    ) -> Tensor {
        let data = f(&self.0.borrow().data);
        Tensor::new_derived(data, backprop_fn, &[self])
    }

    /// Elementwise addition, broadcasting rows or columns of size one
    pub fn try_add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.elementwise(other, "add", BackpropFunc::Add, |a, b| a + b)
    }

    pub fn try_sub(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.elementwise(other, "sub", BackpropFunc::Sub, |a, b| a - b)
    }

    pub fn try_mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.elementwise(other, "mul", BackpropFunc::Mul, |a, b| a * b)
    }

    pub fn try_div(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.elementwise(other, "div", BackpropFunc::Div, |a, b| a / b)
    }

    /// Matrix product `self @ other`
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        let (lhs, rhs) = (self.shape(), other.shape());
        if lhs.1 != rhs.0 {
            return Err(TensorError::ShapeMismatch {
                op: "matmul",
                lhs,
                rhs,
            });
        }
        let data = self.0.borrow().data.dot(&other.0.borrow().data);
        Ok(Tensor::new_derived(data, BackpropFunc::MatMul, &[self, other]))
    }

    pub fn pow(&self, exponent: f32) -> Tensor {
        self.unary(BackpropFunc::Pow(exponent), |a| a.mapv(|x| x.powf(exponent)))
    }

    /// Multiplies every element by a constant
    pub fn scale(&self, factor: f32) -> Tensor {
        self.unary(BackpropFunc::Scale(factor), |a| a.mapv(|x| x * factor))
    }

    pub fn relu(&self) -> Tensor {
        self.unary(BackpropFunc::ReLU, |a| a.mapv(|x| x.max(0.0)))
    }

    pub fn sigmoid(&self) -> Tensor {
        self.unary(BackpropFunc::Sigmoid, |a| a.mapv(|x| 1.0 / (1.0 + (-x).exp())))
    }

    pub fn tanh(&self) -> Tensor {
        self.unary(BackpropFunc::Tanh, |a| a.mapv(f32::tanh))
    }

    pub fn exp(&self) -> Tensor {
        self.unary(BackpropFunc::Exp, |a| a.mapv(f32::exp))
    }

    /// Natural logarithm
    pub fn log(&self) -> Tensor {
        self.unary(BackpropFunc::Log, |a| a.mapv(f32::ln))
    }

    /// Sum of all elements as a 1x1 tensor
    pub fn sum(&self) -> Tensor {
        self.unary(BackpropFunc::Sum, |a| Array2::from_elem((1, 1), a.sum()))
    }

    /// Mean of all elements as a 1x1 tensor
    pub fn mean(&self) -> Tensor {
        self.unary(BackpropFunc::Mean, |a| {
            Array2::from_elem((1, 1), a.mean().unwrap_or(f32::NAN))
        })
    }

    /// Softmax over each row
    pub fn softmax(&self) -> Tensor {
        self.unary(BackpropFunc::Softmax, |a| {
            let exps = shift_by_row_max(a).mapv(f32::exp);
            let sums = exps.sum_axis(Axis(1)).insert_axis(Axis(1));
            &exps / &sums
        })
    }

    /// Log of the softmax over each row, computed with the log-sum-exp trick so large
    /// logits do not overflow
    pub fn log_softmax(&self) -> Tensor {
        self.unary(BackpropFunc::LogSoftmax, |a| {
            let shifted = shift_by_row_max(a);
            let log_sums = shifted
                .mapv(f32::exp)
                .sum_axis(Axis(1))
                .mapv(f32::ln)
                .insert_axis(Axis(1));
            &shifted - &log_sums
        })
    }

    /// Reinterprets the row-major elements with a new shape
    pub fn view(&self, rows: usize, cols: usize) -> Result<Tensor, TensorError> {
        let from = self.shape();
        if from.0 * from.1 != rows * cols {
            return Err(TensorError::InvalidView {
                from,
                to: (rows, cols),
            });
        }
        let data = {
            let inner = self.0.borrow();
            Array2::from_shape_vec((rows, cols), inner.data.iter().copied().collect())
        }
        .map_err(|_| TensorError::InvalidView {
            from,
            to: (rows, cols),
        })?;
        Ok(Tensor::new_derived(data, BackpropFunc::View, &[self]))
    }

    /// Index of the largest element of each row
    pub fn argmax_rows(&self) -> Vec<usize> {
        self.0
            .borrow()
            .data
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 { (i, v) } else { best }
                    })
                    .0
            })
            .collect()
    }
}

fn shift_by_row_max(a: &Array2<f32>) -> Array2<f32> {
    let max = a
        .map_axis(Axis(1), |row| row.fold(f32::NEG_INFINITY, |m, &x| m.max(x)))
        .insert_axis(Axis(1));
    a - &max
}

// pretty print a tensor and its children recursively in a JSON-like format
impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_tensor(tensor: &Tensor, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let inner = tensor.0.borrow();
            let indent_str = " ".repeat(indent);
            let indent_inner = " ".repeat(indent + 2);
            writeln!(f, "{}{{", indent_str)?;
            writeln!(f, "{}\"shape\": {:?},", indent_inner, inner.data.dim())?;
            writeln!(f, "{}\"requires_grad\": {},", indent_inner, inner.requires_grad)?;
            writeln!(f, "{}\"id\": {},", indent_inner, inner.id)?;
            writeln!(
                f,
                "{}\"backprop_fn\": {:?},",
                indent_inner, inner.backprop_fn
            )?;
            writeln!(f, "{}\"children\": [", indent_inner)?;
            for (i, child) in inner.children.iter().enumerate() {
                fmt_tensor(&Tensor(child.clone()), indent + 4, f)?;
                if i < inner.children.len() - 1 {
                    writeln!(f, ",")?;
                } else {
                    writeln!(f)?;
                }
            }
            writeln!(f, "{}]", indent_inner)?;
            write!(f, "{}}}", indent_str)
        }
        fmt_tensor(self, 0, f)
    }
}

/// Convenience macro to implement operator overloads on `&Tensor`
///
/// # Panics
/// The operators panic if the shapes cannot be broadcast, use the `try_*` methods to
/// handle the error instead.
macro_rules! impl_arithmetic(
    ($trait:ident, $trait_method:ident, $try_method:ident, $operator:tt) => {
        impl $trait for &Tensor {
            type Output = Tensor;

            fn $trait_method(self, other: &Tensor) -> Tensor {
                self.$try_method(other).unwrap_or_else(|e| panic!("{}", e))
            }
        }

        impl $trait for Tensor {
            type Output = Tensor;

            fn $trait_method(self, other: Tensor) -> Tensor {
                &self $operator &other
            }
        }
    }
);
impl_arithmetic!(Add, add, try_add, +);
impl_arithmetic!(Sub, sub, try_sub, -);
impl_arithmetic!(Mul, mul, try_mul, *);
impl_arithmetic!(Div, div, try_div, /);

impl Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        self.unary(BackpropFunc::Neg, |a| a.mapv(|x| -x))
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.0.borrow().data == other.0.borrow().data
    }
}

pub(crate) struct InnerTensor {
    // the network uses 32 bit precision floats (roughly 7 decimal digits of precision)
    pub(crate) data: Array2<f32>,
    /// gradient of the output with respect to this tensor, same shape as `data`
    pub(crate) grad: Option<Array2<f32>>,
    pub(crate) requires_grad: bool,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedTensor>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this tensor from its children
    /// `None` when the tensor is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerTensor {
    fn new(data: Array2<f32>, requires_grad: bool) -> Self {
        Self {
            data,
            grad: None,
            requires_grad,
            children: vec![],
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            backprop_fn: None,
        }
    }
}

// Skips the data and the graph, which can be large
impl Debug for InnerTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InnerTensor")
            .field("shape", &self.data.dim())
            .field("requires_grad", &self.requires_grad)
            .field("id", &self.id)
            .field("backprop_fn", &self.backprop_fn)
            .field("n_children", &self.children.len())
            .finish()
    }
}
