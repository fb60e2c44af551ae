//! Operator modules
//!
//! Every operator follows the same lifecycle:
//!
//! ```text
//! Created --initialize--> Initialized --execute--> Initialized
//!    |                        |  ^ initialize (idempotent)
//!    +-------release----------+--+--> Released (terminal)
//! ```
//!
//! `initialize` binds tensors by position, validates, infers the output
//! shape, resolves the kernel variant and only then reconfigures the
//! output, so a failure never leaves a tensor half-updated. `execute`
//! derives scalars and geometry from the current shapes and enqueues
//! without waiting.

pub mod convolution;
pub mod depth2space;
pub mod dilation;
pub mod fully_connected;
pub mod gather;
pub mod lstm;
pub mod maxpool;
pub mod pad;
pub mod reduce;
pub mod resize;
pub mod scale;
pub mod slice;
pub mod tanh;

use std::fmt;
use std::sync::Arc;

use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelHandle, KernelName};
use crate::precision::PrecisionType;
use crate::runtime::Runtime;
use crate::tensor::{Tensor, TensorRef};
use crate::worksize::WorkSize;

pub use convolution::{ConvStrategy, Convolution, ConvolutionParams};
pub use depth2space::{Depth2Space, Depth2SpaceParams};
pub use dilation::{Dilation, DilationParams};
pub use fully_connected::{FcStrategy, FullyConnected, FullyConnectedParams};
pub use gather::{Gather, GatherParams};
pub use lstm::{Lstm, LstmParams};
pub use maxpool::{MaxPool, MaxPoolParams};
pub use pad::{Pad, PadParams};
pub use reduce::{Reduce, ReduceParams, Reducer};
pub use resize::{ResizeBilinear, ResizeBilinearParams};
pub use scale::{Scale, ScaleParams};
pub use slice::{Slice, SliceParams};
pub use tanh::{Tanh, TanhParams};

/// Operator kinds known to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    Gather,
    Pad,
    Convolution,
    FullyConnected,
    MaxPool,
    Reduce,
    ResizeBilinear,
    Scale,
    Slice,
    Tanh,
    Lstm,
    Depth2Space,
    Dilation,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 13] = [
        OperatorKind::Gather,
        OperatorKind::Pad,
        OperatorKind::Convolution,
        OperatorKind::FullyConnected,
        OperatorKind::MaxPool,
        OperatorKind::Reduce,
        OperatorKind::ResizeBilinear,
        OperatorKind::Scale,
        OperatorKind::Slice,
        OperatorKind::Tanh,
        OperatorKind::Lstm,
        OperatorKind::Depth2Space,
        OperatorKind::Dilation,
    ];
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle state of one operator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Initialized,
    /// Only observable from inside `execute`.
    Executing,
    Released,
}

impl Lifecycle {
    fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Initialized => "initialized",
            Lifecycle::Executing => "executing",
            Lifecycle::Released => "released",
        }
    }
}

/// Contract shared by all operator modules.
pub trait Operator {
    type Params;
    const KIND: OperatorKind;

    fn new(runtime: Arc<Runtime>, precision: PrecisionType) -> Self
    where
        Self: Sized;

    /// Bind tensors, infer shapes and resolve kernels. May be called again
    /// on an initialized operator; identical inputs give identical results.
    fn initialize(
        &mut self,
        inputs: &[TensorRef],
        outputs: &[TensorRef],
        params: &Self::Params,
    ) -> Status;

    /// Enqueue the kernels. Returns once they are submitted.
    fn execute(&mut self) -> Status;

    /// Drop kernel handles and tensor bindings. Always succeeds.
    fn release(&mut self) -> Status;

    fn state(&self) -> Lifecycle;

    /// Full names of the kernels resolved by the last `initialize`.
    fn kernel_names(&self) -> Vec<String>;
}

/// Lifecycle bookkeeping and kernel handles common to every operator.
pub struct OperatorBase {
    kind: OperatorKind,
    runtime: Arc<Runtime>,
    precision: PrecisionType,
    state: Lifecycle,
    kernels: Vec<KernelHandle>,
}

impl OperatorBase {
    pub fn new(kind: OperatorKind, runtime: Arc<Runtime>, precision: PrecisionType) -> Self {
        log::debug!("{} created (precision={})", kind, precision);
        Self {
            kind,
            runtime,
            precision,
            state: Lifecycle::Created,
            kernels: Vec::new(),
        }
    }

    pub fn kind(&self) -> OperatorKind {
        self.kind
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn precision(&self) -> PrecisionType {
        self.precision
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    /// Work-group cap for geometry derivation.
    pub fn cap(&self) -> u32 {
        self.runtime.work_group_cap()
    }

    /// A kernel's preferred 1-D work-group width, clamped to the cap.
    pub fn local_size(&self, preferred: u32) -> u32 {
        preferred.min(self.cap()).max(1)
    }

    fn lifecycle_error(&self, phase: &'static str) -> RuntimeError {
        RuntimeError::Lifecycle {
            kind: self.kind,
            phase,
            state: self.state.as_str(),
        }
    }

    /// Gate for `initialize`; valid from Created and Initialized.
    pub fn begin_initialize(&self) -> Status {
        match self.state {
            Lifecycle::Created | Lifecycle::Initialized => Ok(()),
            _ => Err(self.lifecycle_error("initialize")),
        }
    }

    /// Resolve a kernel at this operator's precision.
    pub fn resolve(&self, name: &KernelName) -> Result<KernelHandle, RuntimeError> {
        self.resolve_at(name, self.precision)
    }

    pub fn resolve_at(
        &self,
        name: &KernelName,
        precision: PrecisionType,
    ) -> Result<KernelHandle, RuntimeError> {
        self.runtime.set_kernel(name, precision)
    }

    /// Commit a successful `initialize`.
    pub fn finish_initialize(&mut self, kernels: Vec<KernelHandle>) {
        log::debug!(
            "{} initialized: [{}]",
            self.kind,
            kernels
                .iter()
                .map(KernelHandle::name)
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.kernels = kernels;
        self.state = Lifecycle::Initialized;
    }

    pub fn enter_execute(&mut self) -> Status {
        if self.state != Lifecycle::Initialized {
            return Err(self.lifecycle_error("execute"));
        }
        self.state = Lifecycle::Executing;
        Ok(())
    }

    pub fn leave_execute(&mut self, result: Status) -> Status {
        self.state = Lifecycle::Initialized;
        if let Err(e) = &result {
            log::warn!("{} execute failed: {}", self.kind, e);
        }
        result
    }

    pub fn release(&mut self) -> Status {
        if self.state != Lifecycle::Released {
            log::debug!("{} released", self.kind);
            self.kernels.clear();
            self.state = Lifecycle::Released;
        }
        Ok(())
    }

    pub fn kernel(&self, index: usize) -> Result<&KernelHandle, RuntimeError> {
        self.kernels.get(index).ok_or_else(|| {
            RuntimeError::precondition(self.kind, format!("kernel {} not resolved", index))
        })
    }

    pub fn kernel_names(&self) -> Vec<String> {
        self.kernels.iter().map(|k| k.name().to_string()).collect()
    }

    /// Enqueue through the owning runtime.
    pub fn enqueue(&self, index: usize, args: KernelArgs, work: &WorkSize) -> Status {
        self.runtime.enqueue_kernel(self.kernel(index)?, args, work)
    }
}

impl Drop for OperatorBase {
    fn drop(&mut self) {
        if self.state == Lifecycle::Initialized {
            log::warn!("{} dropped without release", self.kind);
        }
    }
}

/// Fetch the tensor at a fixed position.
pub(crate) fn tensor_at(
    kind: OperatorKind,
    tensors: &[TensorRef],
    index: usize,
    role: &str,
) -> Result<TensorRef, RuntimeError> {
    tensors.get(index).cloned().ok_or_else(|| {
        RuntimeError::precondition(
            kind,
            format!("missing {} tensor at index {} (got {})", role, index, tensors.len()),
        )
    })
}

/// Resolve a possibly negative axis against `rank`.
pub fn normalize_axis(kind: OperatorKind, axis: i32, rank: usize) -> Result<usize, RuntimeError> {
    let r = rank as i64;
    let a = axis as i64;
    if a < -r || a >= r {
        return Err(RuntimeError::shape(
            kind,
            format!("axis {} out of range for rank {}", axis, rank),
        ));
    }
    Ok(if a < 0 { (a + r) as usize } else { a as usize })
}

/// Check the output shape before it is committed.
///
/// With `android_nn` the operator owns shape inference and the output is
/// resized in place; otherwise the caller must have sized it already.
pub(crate) fn check_output_shape(
    kind: OperatorKind,
    output: &Tensor,
    dims: &[u32],
    android_nn: bool,
) -> Status {
    if android_nn || output.dims() == dims {
        return Ok(());
    }
    Err(RuntimeError::precondition(
        kind,
        format!("output is {:?}, expected {:?}", output.dims(), dims),
    ))
}

/// Commit the inferred shape. Call only after every fallible step.
pub(crate) fn apply_output_shape(output: &Tensor, dims: &[u32], android_nn: bool) -> Status {
    if android_nn {
        output.reconfigure_dims_and_buffer(dims)?;
    }
    Ok(())
}

/// Commit several inferred shapes at once: every buffer is allocated
/// before any output changes, so a failed allocation leaves them all as
/// they were.
pub(crate) fn apply_output_shapes(
    outputs: &[TensorRef],
    shapes: &[Vec<u32>],
    android_nn: bool,
) -> Status {
    if !android_nn {
        return Ok(());
    }
    let staged = outputs
        .iter()
        .zip(shapes)
        .map(|(out, dims)| out.stage_reshape(dims))
        .collect::<Result<Vec<_>, _>>()?;
    for (out, staged) in outputs.iter().zip(staged) {
        if let Some(staged) = staged {
            out.commit_reshape(staged);
        }
    }
    Ok(())
}

/// Require a tensor to carry the element type of `precision`.
pub(crate) fn check_storage(
    kind: OperatorKind,
    tensor: &Tensor,
    precision: PrecisionType,
    role: &str,
) -> Status {
    let expected = precision.storage_type();
    if tensor.data_type() != expected {
        return Err(RuntimeError::precondition(
            kind,
            format!(
                "{} is {}, expected {} for {} precision",
                role,
                tensor.data_type(),
                expected,
                precision
            ),
        ));
    }
    Ok(())
}

/// NCHW view of a rank 1..=4 tensor.
pub(crate) fn nchw_of(kind: OperatorKind, tensor: &Tensor, role: &str) -> Result<[u32; 4], RuntimeError> {
    crate::tensor::nchw(&tensor.dims()).ok_or_else(|| {
        RuntimeError::precondition(
            kind,
            format!("{} must have rank 1..=4, got {:?}", role, tensor.dims()),
        )
    })
}

/// Read a small int32 parameter tensor (axes, paddings).
pub(crate) fn read_i32(kind: OperatorKind, tensor: &Tensor, role: &str) -> Result<Vec<i32>, RuntimeError> {
    if tensor.data_type() != crate::tensor::DataType::Int32 {
        return Err(RuntimeError::precondition(
            kind,
            format!("{} must be int32, got {}", role, tensor.data_type()),
        ));
    }
    tensor.read::<i32>()
}

macro_rules! operator_set {
    ($($variant:ident => $op:ty, $params:ty;)+) => {
        /// Parameters of any operator, tagged by kind.
        #[derive(Debug, Clone)]
        pub enum OpParameters {
            $($variant($params),)+
        }

        impl OpParameters {
            pub fn kind(&self) -> OperatorKind {
                match self {
                    $(OpParameters::$variant(_) => OperatorKind::$variant,)+
                }
            }
        }

        /// Any operator, for callers that build graphs from data.
        pub enum AnyOperator {
            $($variant($op),)+
        }

        impl AnyOperator {
            pub fn create(
                kind: OperatorKind,
                runtime: Arc<Runtime>,
                precision: PrecisionType,
            ) -> Self {
                match kind {
                    $(OperatorKind::$variant => {
                        AnyOperator::$variant(<$op as Operator>::new(runtime, precision))
                    })+
                }
            }

            pub fn kind(&self) -> OperatorKind {
                match self {
                    $(AnyOperator::$variant(_) => OperatorKind::$variant,)+
                }
            }

            /// Parameters of another kind fail with `ParamMismatch`.
            pub fn initialize(
                &mut self,
                inputs: &[TensorRef],
                outputs: &[TensorRef],
                params: &OpParameters,
            ) -> Status {
                let expected = self.kind();
                match (self, params) {
                    $((AnyOperator::$variant(op), OpParameters::$variant(p)) => {
                        op.initialize(inputs, outputs, p)
                    })+
                    (_, other) => Err(RuntimeError::ParamMismatch {
                        expected,
                        found: other.kind(),
                    }),
                }
            }

            pub fn execute(&mut self) -> Status {
                match self {
                    $(AnyOperator::$variant(op) => op.execute(),)+
                }
            }

            pub fn release(&mut self) -> Status {
                match self {
                    $(AnyOperator::$variant(op) => op.release(),)+
                }
            }

            pub fn state(&self) -> Lifecycle {
                match self {
                    $(AnyOperator::$variant(op) => op.state(),)+
                }
            }

            pub fn kernel_names(&self) -> Vec<String> {
                match self {
                    $(AnyOperator::$variant(op) => op.kernel_names(),)+
                }
            }
        }
    };
}

operator_set! {
    Gather => Gather, GatherParams;
    Pad => Pad, PadParams;
    Convolution => Convolution, ConvolutionParams;
    FullyConnected => FullyConnected, FullyConnectedParams;
    MaxPool => MaxPool, MaxPoolParams;
    Reduce => Reduce, ReduceParams;
    ResizeBilinear => ResizeBilinear, ResizeBilinearParams;
    Scale => Scale, ScaleParams;
    Slice => Slice, SliceParams;
    Tanh => Tanh, TanhParams;
    Lstm => Lstm, LstmParams;
    Depth2Space => Depth2Space, Depth2SpaceParams;
    Dilation => Dilation, DilationParams;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, TensorDesc};

    #[test]
    fn test_normalize_axis() {
        let k = OperatorKind::Gather;
        assert_eq!(normalize_axis(k, -1, 3).unwrap(), 2);
        assert_eq!(normalize_axis(k, -3, 3).unwrap(), 0);
        assert_eq!(normalize_axis(k, 2, 3).unwrap(), 2);
        assert!(matches!(
            normalize_axis(k, 3, 3),
            Err(RuntimeError::ShapeInference { .. })
        ));
        assert!(normalize_axis(k, -4, 3).is_err());
    }

    #[test]
    fn test_base_lifecycle() {
        let rt = Runtime::host().unwrap();
        let mut base = OperatorBase::new(OperatorKind::Tanh, rt, PrecisionType::Fp32);
        assert_eq!(base.state(), Lifecycle::Created);
        assert!(base.enter_execute().is_err());

        base.begin_initialize().unwrap();
        base.finish_initialize(Vec::new());
        base.enter_execute().unwrap();
        assert_eq!(base.state(), Lifecycle::Executing);
        base.leave_execute(Ok(())).unwrap();
        assert_eq!(base.state(), Lifecycle::Initialized);

        base.release().unwrap();
        base.release().unwrap();
        assert!(base.begin_initialize().is_err());
        assert!(matches!(
            base.enter_execute(),
            Err(RuntimeError::Lifecycle { .. })
        ));
    }

    #[test]
    fn test_any_operator_rejects_foreign_params() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[1, 1, 2, 2], DataType::Float32)).unwrap();
        let output = rt.create_tensor(TensorDesc::new(&[1, 1, 2, 2], DataType::Float32)).unwrap();
        let mut op = AnyOperator::create(OperatorKind::Tanh, rt, PrecisionType::Fp32);
        let err = op
            .initialize(
                &[input],
                &[output],
                &OpParameters::Gather(GatherParams::default()),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::ParamMismatch {
                expected: OperatorKind::Tanh,
                found: OperatorKind::Gather
            }
        ));
        assert_eq!(op.state(), Lifecycle::Created);
    }

    #[test]
    fn test_every_kind_can_be_created() {
        let rt = Runtime::host().unwrap();
        for kind in OperatorKind::ALL {
            let op = AnyOperator::create(kind, Arc::clone(&rt), PrecisionType::Fp32);
            assert_eq!(op.kind(), kind);
            assert_eq!(op.state(), Lifecycle::Created);
        }
    }
}
