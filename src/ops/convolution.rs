//! 2-D convolution, NCHW input and OIHW weights.
//!
//! Strategy selection depends only on shapes, precision and the device
//! vendor, all known at initialize. The PowerVR block chosen here feeds both
//! the kernel name and the launch grid.

use std::fmt;
use std::sync::Arc;

use crate::backend::Vendor;
use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelName};
use crate::ops::{
    apply_output_shape, check_output_shape, check_storage, nchw_of, tensor_at, Lifecycle,
    Operator, OperatorBase, OperatorKind,
};
use crate::precision::{Activation, PrecisionType};
use crate::runtime::Runtime;
use crate::tensor::TensorRef;
use crate::worksize::{
    div_round_up, find_max_factor, powervr_work_size, BlockSize, WorkSize, DILATED_COLUMN_BLOCK,
    GEMM_CHANNEL_BLOCK,
};

/// Geometry and fusion flags of a 2-D convolution.
///
/// Inputs are `[input, weight, bias?, merge?]`; the weight is laid out as
/// `[out_c, in_c / groups, kh, kw]`.
#[derive(Debug, Clone)]
pub struct ConvolutionParams {
    /// (height, width)
    pub stride: (u32, u32),
    /// (top, bottom, left, right)
    pub pad: (u32, u32, u32, u32),
    /// (height, width); 1 is a dense filter.
    pub dilation: (u32, u32),
    /// Channel groups. Input and output channels must both divide evenly.
    pub groups: u32,
    /// Clamp fused after the bias and merge.
    pub activation: Activation,
    /// Bias tensor at input 2.
    pub bias_term: bool,
    /// Residual tensor added before the activation, after the bias.
    pub merge_add: bool,
    pub android_nn: bool,
}

impl Default for ConvolutionParams {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            pad: (0, 0, 0, 0),
            dilation: (1, 1),
            groups: 1,
            activation: Activation::None,
            bias_term: false,
            merge_add: false,
            android_nn: false,
        }
    }
}

/// Everything strategy selection looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub batch: u32,
    pub in_c: u32,
    pub in_h: u32,
    pub in_w: u32,
    pub out_c: u32,
    pub out_h: u32,
    pub out_w: u32,
    pub kernel: (u32, u32),
    pub stride: (u32, u32),
    pub pad: (u32, u32, u32, u32),
    pub dilation: (u32, u32),
    pub groups: u32,
}

impl ConvShape {
    fn no_padding(&self) -> bool {
        self.pad == (0, 0, 0, 0)
    }

    fn is_pointwise(&self) -> bool {
        self.kernel == (1, 1) && self.groups == 1 && self.no_padding()
    }

    fn is_dilated(&self) -> bool {
        self.dilation.0 > 1 || self.dilation.1 > 1
    }

    fn fits_direct(&self, precision: PrecisionType) -> bool {
        if self.groups != 1 || self.stride != (1, 1) {
            return false;
        }
        match self.kernel {
            (k, k2) if k == k2 && matches!(k, 5 | 7 | 9) => self.out_w % 8 == 0,
            (3, 3) => precision == PrecisionType::Fp32,
            _ => false,
        }
    }

    fn fits_dilated_rows(&self) -> bool {
        self.dilation == (8, 8)
            && self.kernel == (3, 3)
            && self.pad == (8, 8, 8, 8)
            && self.stride == (1, 1)
            && self.groups == 1
            && self.out_w % 8 == 0
    }
}

/// Kernel family chosen for a convolution shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStrategy {
    /// One item per output pixel and channel, looping over the whole filter.
    Direct,
    /// 1x1 filter at stride 1.
    Pointwise,
    PointwiseStride2,
    /// Blocked GEMM; the fallback for everything else.
    GemmBlocked,
    /// 3x3 filter, dilation 8, pad 8, processed in 4x8 output rows.
    DilatedRows,
    /// Float path on PowerVR devices. The block size is baked into the
    /// kernel name.
    PowerVr {
        is1x1: bool,
        /// Input channels in groups of four.
        src_depth: u32,
        block: BlockSize,
    },
}

impl ConvStrategy {
    pub fn select(
        shape: &ConvShape,
        precision: PrecisionType,
        vendor: Vendor,
        compute_units: u32,
    ) -> Self {
        if vendor == Vendor::PowerVR && precision.is_float() && shape.groups == 1 {
            return powervr_strategy(shape, precision, compute_units);
        }
        if shape.is_dilated() {
            return if shape.fits_dilated_rows() {
                ConvStrategy::DilatedRows
            } else if shape.fits_direct(precision) {
                ConvStrategy::Direct
            } else {
                ConvStrategy::GemmBlocked
            };
        }
        if shape.is_pointwise() {
            match shape.stride {
                (1, 1) => return ConvStrategy::Pointwise,
                (2, 2) => return ConvStrategy::PointwiseStride2,
                _ => {}
            }
        }
        if shape.fits_direct(precision) {
            ConvStrategy::Direct
        } else {
            ConvStrategy::GemmBlocked
        }
    }

    /// Base name plus structural infix tokens.
    pub fn kernel_name(self) -> KernelName {
        match self {
            ConvStrategy::Direct => KernelName::new("direct"),
            ConvStrategy::Pointwise => KernelName::new("conv11"),
            ConvStrategy::PointwiseStride2 => KernelName::new("conv11_stride2"),
            ConvStrategy::GemmBlocked => KernelName::new("gemmBlocked"),
            ConvStrategy::DilatedRows => KernelName::new("dilation_conv_k3d8p8_4x8"),
            ConvStrategy::PowerVr {
                is1x1,
                src_depth,
                block,
            } => KernelName::new("powervr")
                .infix(&format!("_is1x1{}", is1x1 as u32))
                .infix(&format!("_srcdepth{}", src_depth))
                .infix(&block.token()),
        }
    }

    pub fn work_size(self, shape: &ConvShape, cap: u32) -> WorkSize {
        let s = shape;
        let plane = s.out_h * s.out_w;
        match self {
            ConvStrategy::Direct => WorkSize::three_d(
                [s.out_w, s.out_h, s.batch * s.out_c],
                Some([find_max_factor(s.out_w, cap), 1, 1]),
            ),
            ConvStrategy::Pointwise | ConvStrategy::PointwiseStride2 => WorkSize::three_d(
                [plane, s.out_c, s.batch],
                Some([find_max_factor(plane, cap), 1, 1]),
            ),
            ConvStrategy::GemmBlocked => WorkSize::three_d(
                [plane, div_round_up(s.out_c, GEMM_CHANNEL_BLOCK), s.batch],
                Some([find_max_factor(plane, cap), 1, 1]),
            ),
            ConvStrategy::DilatedRows => {
                let columns = div_round_up(s.out_w, DILATED_COLUMN_BLOCK);
                WorkSize::three_d(
                    [columns, s.out_h, s.batch * s.out_c],
                    Some([find_max_factor(columns, cap), 1, 1]),
                )
            }
            ConvStrategy::PowerVr { block, .. } => powervr_work_size(
                s.out_w * s.batch,
                s.out_h,
                div_round_up(s.out_c, GEMM_CHANNEL_BLOCK),
                block,
                cap,
            ),
        }
    }
}

impl fmt::Display for ConvStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kernel_name().stem())
    }
}

fn powervr_strategy(shape: &ConvShape, precision: PrecisionType, compute_units: u32) -> ConvStrategy {
    let src_depth = div_round_up(shape.in_c, 4);
    let dst_depth = div_round_up(shape.out_c, 4);
    let task = shape.out_w as u64 * shape.batch as u64 * shape.out_h as u64 * dst_depth as u64
        / compute_units.max(1) as u64;
    let fp16 = precision == PrecisionType::Fp16;
    let block = if (fp16 && task > 4096) || (!fp16 && task > 3072) {
        4
    } else if (fp16 && task > 1536) || (!fp16 && task > 256) {
        2
    } else {
        1
    };

    let is1x1 = shape.kernel == (1, 1)
        && shape.stride == (1, 1)
        && shape.dilation == (1, 1)
        && shape.no_padding();
    let (block_size, depth) = if is1x1 {
        let size = match block {
            4 if dst_depth == 1 || dst_depth == 3 => BlockSize::new(2, 2, 1),
            4 => BlockSize::new(2, 1, 2),
            2 => BlockSize::new(2, 1, 1),
            _ => BlockSize::new(1, 1, 1),
        };
        let depth = if src_depth % 4 == 0 && block == 1 && fp16 { 4 } else { 1 };
        (size, depth)
    } else {
        let size = match block {
            4 => BlockSize::new(2, 1, 2),
            2 => BlockSize::new(2, 1, 1),
            _ => BlockSize::new(1, 1, 1),
        };
        let depth = if src_depth % 2 == 0 && block <= 2 { 2 } else { 1 };
        (size, depth)
    };
    ConvStrategy::PowerVr {
        is1x1,
        src_depth: depth,
        block: block_size,
    }
}

/// Output extent along one axis; `None` when the dilated window exceeds the
/// padded input.
pub fn conv_extent(input: u32, kernel: u32, stride: u32, dilation: u32, pad: (u32, u32)) -> Option<u32> {
    if stride == 0 || kernel == 0 || dilation == 0 {
        return None;
    }
    let span = dilation.checked_mul(kernel - 1)?.checked_add(1)?;
    let padded = input.checked_add(pad.0)?.checked_add(pad.1)?;
    padded.checked_sub(span).map(|rest| rest / stride + 1)
}

struct Bound {
    input: TensorRef,
    weight: TensorRef,
    bias: Option<TensorRef>,
    merge: Option<TensorRef>,
    output: TensorRef,
    shape: ConvShape,
    strategy: ConvStrategy,
}

/// 2-D convolution with optional bias, residual merge and activation.
pub struct Convolution {
    base: OperatorBase,
    bound: Option<Bound>,
}

impl Operator for Convolution {
    type Params = ConvolutionParams;
    const KIND: OperatorKind = OperatorKind::Convolution;

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
        params: &ConvolutionParams,
    ) -> Status {
        self.base.begin_initialize()?;
        let input = tensor_at(Self::KIND, inputs, 0, "input")?;
        let weight = tensor_at(Self::KIND, inputs, 1, "weight")?;
        let bias = if params.bias_term {
            Some(tensor_at(Self::KIND, inputs, 2, "bias")?)
        } else {
            None
        };
        let merge = if params.merge_add {
            Some(tensor_at(Self::KIND, inputs, 2 + params.bias_term as usize, "merge")?)
        } else {
            None
        };
        let output = tensor_at(Self::KIND, outputs, 0, "output")?;

        let precision = self.base.precision();
        check_storage(Self::KIND, &input, precision, "input")?;
        check_storage(Self::KIND, &weight, precision, "weight")?;
        check_storage(Self::KIND, &output, precision, "output")?;
        if input.num_dims() != 4 || weight.num_dims() != 4 {
            return Err(RuntimeError::precondition(
                Self::KIND,
                format!(
                    "input and weight must be 4-D, got {:?} and {:?}",
                    input.dims(),
                    weight.dims()
                ),
            ));
        }

        let [n, in_c, in_h, in_w] = nchw_of(Self::KIND, &input, "input")?;
        let [out_c, w_in_c, kh, kw] = nchw_of(Self::KIND, &weight, "weight")?;
        let groups = params.groups;
        if groups == 0
            || in_c % groups != 0
            || out_c % groups != 0
            || w_in_c.checked_mul(groups) != Some(in_c)
        {
            return Err(RuntimeError::precondition(
                Self::KIND,
                format!(
                    "weight {:?} does not fit {} input channels in {} groups",
                    weight.dims(),
                    in_c,
                    groups
                ),
            ));
        }
        if let Some(b) = &bias {
            check_storage(Self::KIND, b, precision, "bias")?;
            if b.total_size() != out_c as usize {
                return Err(RuntimeError::precondition(
                    Self::KIND,
                    format!("bias has {} values for {} channels", b.total_size(), out_c),
                ));
            }
        }

        let (pt, pb, pl, pr) = params.pad;
        let oh = conv_extent(in_h, kh, params.stride.0, params.dilation.0, (pt, pb));
        let ow = conv_extent(in_w, kw, params.stride.1, params.dilation.1, (pl, pr));
        let (out_h, out_w) = oh.zip(ow).ok_or_else(|| {
            RuntimeError::shape(
                Self::KIND,
                format!(
                    "{}x{} kernel (dilation {:?}, stride {:?}, pad {:?}) does not fit {}x{}",
                    kh, kw, params.dilation, params.stride, params.pad, in_h, in_w
                ),
            )
        })?;
        let out_dims = [n, out_c, out_h, out_w];
        check_output_shape(Self::KIND, &output, &out_dims, params.android_nn)?;
        if let Some(m) = &merge {
            check_storage(Self::KIND, m, precision, "merge")?;
            if m.dims() != out_dims {
                return Err(RuntimeError::precondition(
                    Self::KIND,
                    format!("merge tensor is {:?}, expected {:?}", m.dims(), out_dims),
                ));
            }
        }

        let shape = ConvShape {
            batch: n,
            in_c,
            in_h,
            in_w,
            out_c,
            out_h,
            out_w,
            kernel: (kh, kw),
            stride: params.stride,
            pad: params.pad,
            dilation: params.dilation,
            groups,
        };
        let runtime = self.base.runtime();
        let strategy =
            ConvStrategy::select(&shape, precision, runtime.vendor(), runtime.compute_units());
        let name = strategy
            .kernel_name()
            .merge_add(params.merge_add)
            .activation(params.activation)
            .signed(precision == PrecisionType::Int8);
        let kernel = self.base.resolve(&name)?;
        apply_output_shape(&output, &out_dims, params.android_nn)?;
        log::debug!("Convolution: {} for {:?}", strategy, shape);

        self.bound = Some(Bound {
            input,
            weight,
            bias,
            merge,
            output,
            shape,
            strategy,
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

impl Convolution {
    pub fn strategy(&self) -> Option<ConvStrategy> {
        self.bound.as_ref().map(|b| b.strategy)
    }

    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        let s = &b.shape;
        if b.input.total_size() == 0 || b.output.total_size() == 0 {
            return Ok(());
        }
        let work = b.strategy.work_size(s, self.base.cap());
        // unused slots are filled with a bound buffer the kernel never reads
        let bias = b.bias.as_ref().unwrap_or(&b.weight);
        let merge = b.merge.as_ref().unwrap_or(&b.output);
        let args = KernelArgs::new()
            .buffer(&b.input)
            .buffer(&b.weight)
            .buffer(bias)
            .buffer(merge)
            .buffer(&b.output)
            .u32(s.batch)
            .u32(s.in_c)
            .u32(s.in_h)
            .u32(s.in_w)
            .u32(s.out_c)
            .u32(s.out_h)
            .u32(s.out_w)
            .u32(s.kernel.0)
            .u32(s.kernel.1)
            .u32(s.stride.0)
            .u32(s.stride.1)
            .u32(s.pad.0)
            .u32(s.pad.2)
            .u32(s.dilation.0)
            .u32(s.dilation.1)
            .u32(s.groups)
            .u32(b.bias.is_some() as u32);
        self.base.enqueue(0, args, &work)
    }
}
