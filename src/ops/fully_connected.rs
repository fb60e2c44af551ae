//! Fully-connected layer: `out[b, n] = Σ_k in[b, k] · w[n, k] + bias[n]`.
//!
//! The input is viewed as `[total / K, K]` whatever its rank. Four kernel
//! strategies compute the same product and differ only in geometry.

use std::fmt;
use std::sync::Arc;

use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelName};
use crate::ops::{
    apply_output_shape, check_output_shape, check_storage, tensor_at, Lifecycle, Operator,
    OperatorBase, OperatorKind,
};
use crate::precision::{Activation, PrecisionType};
use crate::runtime::Runtime;
use crate::tensor::TensorRef;
use crate::worksize::{align_to, div_round_up, find_max_factor, WorkSize, FC_BLOCK};

/// Batches above this use the 8x1 blocked kernels.
pub const OPT_BATCH: u32 = 100;
/// Longest reduction the gemv variant handles.
pub const GEMV_MAX_INNER: u32 = 256;

const DIRECT_LOCAL: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcStrategy {
    /// Single batch, one item per output unit.
    Direct,
    /// Large float batches with a short inner dimension: eight units per
    /// item.
    Gemv8x1,
    /// Large float batches with a long inner dimension, split across items.
    Split8x1,
    Base,
}

impl FcStrategy {
    pub fn select(precision: PrecisionType, batch: u32, inner: u32, android_nn: bool) -> Self {
        let float = precision.is_float();
        if batch > OPT_BATCH && float {
            if inner <= GEMV_MAX_INNER {
                FcStrategy::Gemv8x1
            } else {
                FcStrategy::Split8x1
            }
        } else if android_nn && float && batch == 1 {
            FcStrategy::Direct
        } else {
            FcStrategy::Base
        }
    }

    pub fn kernel_base(self) -> &'static str {
        match self {
            FcStrategy::Direct => "fc_direct_opt",
            FcStrategy::Gemv8x1 => "fc_8x1_gemv",
            FcStrategy::Split8x1 => "fc_splitopt_8x1",
            FcStrategy::Base => "fc",
        }
    }
}

impl fmt::Display for FcStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kernel_base())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FullyConnectedParams {
    pub activation: Activation,
    /// Infer the output shape and resize the output to it. When false the
    /// output must already have the inferred shape.
    pub android_nn: bool,
}

struct Bound {
    input: TensorRef,
    weight: TensorRef,
    bias: Option<TensorRef>,
    output: TensorRef,
    strategy: FcStrategy,
    batch: u32,
    inner: u32,
    units: u32,
}

/// `output = activation(input · weightᵀ + bias)` over a batch of rows.
///
/// Inputs are `[input, weight, bias?]` with the weight as `[units, inner]`.
pub struct FullyConnected {
    base: OperatorBase,
    bound: Option<Bound>,
}

impl Operator for FullyConnected {
    type Params = FullyConnectedParams;
    const KIND: OperatorKind = OperatorKind::FullyConnected;

    fn new(runtime: Arc<Runtime>, precision: PrecisionType) -> Self {
        Self {
            base: OperatorBase::new(Self::KIND, runtime, precision),
            bound: None,
        }
    }

    fn initialize(
        &mut self,
        inputs: &[TensorRef],
        outputs: &[TensorRef],
        params: &FullyConnectedParams,
    ) -> Status {
        self.base.begin_initialize()?;
        let input = tensor_at(Self::KIND, inputs, 0, "input")?;
        let weight = tensor_at(Self::KIND, inputs, 1, "weight")?;
        let bias = inputs.get(2).cloned();
        let output = tensor_at(Self::KIND, outputs, 0, "output")?;
        let precision = self.base.precision();
        check_storage(Self::KIND, &input, precision, "input")?;
        check_storage(Self::KIND, &weight, precision, "weight")?;
        check_storage(Self::KIND, &output, precision, "output")?;

        let w_dims = weight.dims();
        let (units, inner) = match w_dims[..] {
            [n, k] if k > 0 => (n, k),
            _ => {
                return Err(RuntimeError::precondition(
                    Self::KIND,
                    format!("weight must be [N, K], got {:?}", w_dims),
                ))
            }
        };
        if let Some(b) = &bias {
            check_storage(Self::KIND, b, precision, "bias")?;
            if b.total_size() != units as usize {
                return Err(RuntimeError::precondition(
                    Self::KIND,
                    format!("bias has {} values for {} units", b.total_size(), units),
                ));
            }
        }
        let total = input.total_size() as u32;
        if total % inner != 0 {
            return Err(RuntimeError::shape(
                Self::KIND,
                format!("{} input values do not flatten into rows of {}", total, inner),
            ));
        }
        let batch = total / inner;
        let out_dims = [batch, units];
        check_output_shape(Self::KIND, &output, &out_dims, params.android_nn)?;

        let strategy = FcStrategy::select(precision, batch, inner, params.android_nn);
        let name = KernelName::new(strategy.kernel_base()).activation(params.activation);
        let kernel = self.base.resolve(&name)?;
        apply_output_shape(&output, &out_dims, params.android_nn)?;
        log::debug!(
            "FullyConnected: {} for batch={} K={} N={}",
            strategy,
            batch,
            inner,
            units
        );

        self.bound = Some(Bound {
            input,
            weight,
            bias,
            output,
            strategy,
            batch,
            inner,
            units,
        });
        self.base.finish_initialize(vec![kernel]);
        Ok(())
    }

    fn execute(&mut self) -> Status {
        self.base.enter_execute()?;
        let result = self.enqueue();
        self.base.leave_execute(result)
    }

    fn release(&mut self) -> Status {
        self.bound = None;
        self.base.release()
    }

    fn state(&self) -> Lifecycle {
        self.base.state()
    }

    fn kernel_names(&self) -> Vec<String> {
        self.base.kernel_names()
    }
}

impl FullyConnected {
    pub fn strategy(&self) -> Option<FcStrategy> {
        self.bound.as_ref().map(|b| b.strategy)
    }

    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        if b.batch == 0 || b.units == 0 {
            return Ok(());
        }
        let cap = self.base.cap();
        let work = match b.strategy {
            FcStrategy::Direct => {
                let local = self.base.local_size(DIRECT_LOCAL);
                WorkSize::one_d(align_to(b.units, local), Some(local))
            }
            FcStrategy::Gemv8x1 | FcStrategy::Split8x1 => WorkSize::two_d(
                [div_round_up(b.units, FC_BLOCK), b.batch],
                Some([1, find_max_factor(b.batch, cap)]),
            ),
            FcStrategy::Base => WorkSize::two_d(
                [b.units, b.batch],
                Some([find_max_factor(b.units, cap), 1]),
            ),
        };
        // without a bias the weight buffer fills the slot and bias_term is 0
        let bias = b.bias.as_ref().unwrap_or(&b.weight);
        let args = KernelArgs::new()
            .buffer(&b.input)
            .buffer(&b.weight)
            .buffer(bias)
            .buffer(&b.output)
            .u32(b.batch)
            .u32(b.inner)
            .u32(b.units)
            .u32(b.bias.is_some() as u32);
        self.base.enqueue(0, args, &work)
    }
}
