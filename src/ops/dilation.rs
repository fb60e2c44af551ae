//! Spread a filter's taps apart for dilated convolution.
//!
//! The output filter is zero-filled, then every tap `w[n, c, y, x]` lands at
//! `[n, c, y * dh, x * dw]`.

use std::sync::Arc;

use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelName};
use crate::ops::{
    apply_output_shape, check_output_shape, check_storage, nchw_of, tensor_at, Lifecycle,
    Operator, OperatorBase, OperatorKind,
};
use crate::precision::PrecisionType;
use crate::runtime::Runtime;
use crate::tensor::TensorRef;
use crate::worksize::{align_to, WorkSize};

const FILL_LOCAL: u32 = 64;

#[derive(Debug, Clone)]
pub struct DilationParams {
    /// (height, width)
    pub dilation: (u32, u32),
    pub android_nn: bool,
}

impl Default for DilationParams {
    fn default() -> Self {
        Self {
            dilation: (1, 1),
            android_nn: false,
        }
    }
}

struct Bound {
    weight: TensorRef,
    output: TensorRef,
    dilation: (u32, u32),
    /// Stored value of a real zero.
    zero: f32,
}

/// Filter spreader feeding dilated convolution.
pub struct Dilation {
    base: OperatorBase,
    bound: Option<Bound>,
}

/// Extent of a dilated filter axis; `None` on overflow.
pub fn dilated_extent(kernel: u32, dilation: u32) -> Option<u32> {
    dilation.checked_mul(kernel.max(1) - 1)?.checked_add(1)
}

impl Operator for Dilation {
    type Params = DilationParams;
    const KIND: OperatorKind = OperatorKind::Dilation;

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
        params: &DilationParams,
    ) -> Status {
        self.base.begin_initialize()?;
        let weight = tensor_at(Self::KIND, inputs, 0, "weight")?;
        let output = tensor_at(Self::KIND, outputs, 0, "output")?;
        let precision = self.base.precision();
        check_storage(Self::KIND, &weight, precision, "weight")?;
        check_storage(Self::KIND, &output, precision, "output")?;
        if weight.num_dims() != 4 {
            return Err(RuntimeError::precondition(
                Self::KIND,
                format!("weight must be [N, C, kh, kw], got {:?}", weight.dims()),
            ));
        }
        let (dh, dw) = params.dilation;
        if dh == 0 || dw == 0 {
            return Err(RuntimeError::shape(
                Self::KIND,
                format!("dilation {:?} must be positive", params.dilation),
            ));
        }

        let [n, c, kh, kw] = nchw_of(Self::KIND, &weight, "weight")?;
        let (oh, ow) = dilated_extent(kh, dh)
            .zip(dilated_extent(kw, dw))
            .ok_or_else(|| {
                RuntimeError::shape(
                    Self::KIND,
                    format!("{}x{} filter dilated by {:?} overflows", kh, kw, params.dilation),
                )
            })?;
        let out_dims = [n, c, oh, ow];
        check_output_shape(Self::KIND, &output, &out_dims, params.android_nn)?;

        let signed = precision == PrecisionType::Int8;
        let init = self.base.resolve(&KernelName::new("dilation_init").signed(signed))?;
        let spread = self.base.resolve(&KernelName::new("dilation").signed(signed))?;
        apply_output_shape(&output, &out_dims, params.android_nn)?;

        let zero = match (precision.is_quantized(), output.quant()) {
            (true, Some(q)) => q.zero_point as f32,
            _ => 0.0,
        };
        self.bound = Some(Bound {
            weight,
            output,
            dilation: params.dilation,
            zero,
        });
        self.base.finish_initialize(vec![init, spread]);
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

impl Dilation {
    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        let count = b.output.total_size() as u32;
        if count == 0 {
            return Ok(());
        }
        let fill = KernelArgs::new().buffer(&b.output).u32(count).f32(b.zero);
        let local = self.base.local_size(FILL_LOCAL);
        self.base
            .enqueue(0, fill, &WorkSize::one_d(align_to(count, local), Some(local)))?;

        let [n, c, kh, kw] = nchw_of(Self::KIND, &b.weight, "weight")?;
        let [_, _, out_h, out_w] = nchw_of(Self::KIND, &b.output, "output")?;
        let args = KernelArgs::new()
            .buffer(&b.weight)
            .buffer(&b.output)
            .u32(out_h)
            .u32(out_w)
            .u32(b.dilation.0)
            .u32(b.dilation.1)
            .u32(kh)
            .u32(kw);
        self.base.enqueue(1, args, &WorkSize::three_d([n * c, kh, kw], None))
    }
}
