//! 2-D max pooling with an optional fused activation.

use std::sync::Arc;

use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelName};
use crate::ops::{
    apply_output_shape, check_output_shape, check_storage, nchw_of, tensor_at, Lifecycle,
    Operator, OperatorBase, OperatorKind,
};
use crate::precision::{Activation, PrecisionType};
use crate::runtime::Runtime;
use crate::tensor::TensorRef;
use crate::worksize::{align_to, WorkSize};

const LOCAL: u32 = 16;

#[derive(Debug, Clone)]
pub struct MaxPoolParams {
    /// (height, width)
    pub filter: (u32, u32),
    pub stride: (u32, u32),
    /// (top, bottom, left, right)
    pub pad: (u32, u32, u32, u32),
    pub activation: Activation,
    pub android_nn: bool,
}

impl Default for MaxPoolParams {
    fn default() -> Self {
        Self {
            filter: (1, 1),
            stride: (1, 1),
            pad: (0, 0, 0, 0),
            activation: Activation::None,
            android_nn: false,
        }
    }
}

struct Bound {
    input: TensorRef,
    output: TensorRef,
    params: MaxPoolParams,
}

pub struct MaxPool {
    base: OperatorBase,
    bound: Option<Bound>,
}

/// Pooled extent along one axis; `None` when the window does not fit.
pub fn pooled_extent(input: u32, filter: u32, stride: u32, pad_before: u32, pad_after: u32) -> Option<u32> {
    if stride == 0 || filter == 0 {
        return None;
    }
    let span = input
        .checked_add(stride)?
        .checked_add(pad_before)?
        .checked_add(pad_after)?
        .checked_sub(filter)?;
    match span / stride {
        0 => None,
        n => Some(n),
    }
}

impl Operator for MaxPool {
    type Params = MaxPoolParams;
    const KIND: OperatorKind = OperatorKind::MaxPool;

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
        params: &MaxPoolParams,
    ) -> Status {
        self.base.begin_initialize()?;
        let input = tensor_at(Self::KIND, inputs, 0, "input")?;
        let output = tensor_at(Self::KIND, outputs, 0, "output")?;
        let precision = self.base.precision();
        check_storage(Self::KIND, &input, precision, "input")?;
        check_storage(Self::KIND, &output, precision, "output")?;
        if input.num_dims() != 4 {
            return Err(RuntimeError::precondition(
                Self::KIND,
                format!("input must be 4-D, got {:?}", input.dims()),
            ));
        }

        let [n, c, h, w] = nchw_of(Self::KIND, &input, "input")?;
        let (fh, fw) = params.filter;
        let (sh, sw) = params.stride;
        let (pt, pb, pl, pr) = params.pad;
        let oh = pooled_extent(h, fh, sh, pt, pb);
        let ow = pooled_extent(w, fw, sw, pl, pr);
        let (oh, ow) = oh.zip(ow).ok_or_else(|| {
            RuntimeError::shape(
                Self::KIND,
                format!(
                    "{}x{} window, stride {:?}, pad {:?} does not fit {}x{}",
                    fh, fw, params.stride, params.pad, h, w
                ),
            )
        })?;
        let out_dims = [n, c, oh, ow];
        check_output_shape(Self::KIND, &output, &out_dims, params.android_nn)?;

        let name = KernelName::new("maxpooling")
            .activation(params.activation)
            .signed(precision == PrecisionType::Int8);
        let kernel = self.base.resolve(&name)?;
        apply_output_shape(&output, &out_dims, params.android_nn)?;

        self.bound = Some(Bound {
            input,
            output,
            params: params.clone(),
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

impl MaxPool {
    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        let [_, _, in_h, in_w] = nchw_of(Self::KIND, &b.input, "input")?;
        let [n, c, out_h, out_w] = nchw_of(Self::KIND, &b.output, "output")?;
        if n * c * out_h * out_w == 0 {
            return Ok(());
        }
        let p = &b.params;
        // the kernel reads the channel count back from global[1]
        let local = self.base.local_size(LOCAL);
        let work = WorkSize::three_d([n, c, align_to(out_h * out_w, local)], Some([1, 1, local]));
        let args = KernelArgs::new()
            .buffer(&b.input)
            .buffer(&b.output)
            .u32(in_h)
            .u32(in_w)
            .u32(out_h)
            .u32(out_w)
            .u32(p.filter.0)
            .u32(p.filter.1)
            .u32(p.stride.0)
            .u32(p.stride.1)
            .u32(p.pad.0)
            .u32(p.pad.2);
        self.base.enqueue(0, args, &work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, TensorDesc};
    use pretty_assertions::assert_eq;

    fn pool(
        rt: &Arc<Runtime>,
        precision: PrecisionType,
        input: TensorRef,
        params: &MaxPoolParams,
    ) -> Result<(MaxPool, TensorRef), RuntimeError> {
        let output = rt.create_tensor(TensorDesc::new(&[1], precision.storage_type()))?;
        let mut op = MaxPool::new(Arc::clone(rt), precision);
        op.initialize(&[input], &[Arc::clone(&output)], params)?;
        op.execute()?;
        rt.finish()?;
        Ok((op, output))
    }

    fn ramp(rt: &Arc<Runtime>) -> TensorRef {
        let input = rt.create_tensor(TensorDesc::new(&[1, 1, 4, 4], DataType::Float32)).unwrap();
        input.write(&(0..16).map(|v| v as f32).collect::<Vec<_>>()).unwrap();
        input
    }

    #[test]
    fn test_pooled_extent() {
        assert_eq!(pooled_extent(4, 2, 2, 0, 0), Some(2));
        assert_eq!(pooled_extent(3, 2, 1, 0, 0), Some(2));
        assert_eq!(pooled_extent(5, 3, 2, 1, 1), Some(3));
        assert_eq!(pooled_extent(1, 4, 1, 0, 0), None);
        assert_eq!(pooled_extent(4, 2, 0, 0, 0), None);
        assert_eq!(pooled_extent(4, 2, 1, u32::MAX, 0), None);
    }

    #[test]
    fn test_two_by_two_stride_two() {
        let rt = Runtime::host().unwrap();
        let params = MaxPoolParams {
            filter: (2, 2),
            stride: (2, 2),
            android_nn: true,
            ..MaxPoolParams::default()
        };
        let (op, out) = pool(&rt, PrecisionType::Fp32, ramp(&rt), &params).unwrap();
        assert_eq!(op.kernel_names(), vec!["maxpooling_FP32".to_string()]);
        assert_eq!(out.dims(), vec![1, 1, 2, 2]);
        assert_eq!(out.read::<f32>().unwrap(), vec![5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn test_fused_relu6() {
        let rt = Runtime::host().unwrap();
        let params = MaxPoolParams {
            filter: (2, 2),
            stride: (2, 2),
            activation: Activation::Relu6,
            android_nn: true,
            ..MaxPoolParams::default()
        };
        let (op, out) = pool(&rt, PrecisionType::Fp32, ramp(&rt), &params).unwrap();
        assert_eq!(op.kernel_names(), vec!["RELU6maxpooling_FP32".to_string()]);
        assert_eq!(out.read::<f32>().unwrap(), vec![5.0, 6.0, 6.0, 6.0]);
    }

    #[test]
    fn test_padding_is_ignored_by_the_max() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[1, 1, 2, 2], DataType::Int8)).unwrap();
        input.write(&[-5i8, -6, -7, -8]).unwrap();
        let params = MaxPoolParams {
            filter: (2, 2),
            stride: (1, 1),
            pad: (1, 0, 1, 0),
            android_nn: true,
            ..MaxPoolParams::default()
        };
        let (op, out) = pool(&rt, PrecisionType::Int8, input, &params).unwrap();
        assert_eq!(op.kernel_names(), vec!["SIGNEDmaxpooling_INT8".to_string()]);
        assert_eq!(out.dims(), vec![1, 1, 2, 2]);
        assert_eq!(out.read::<i8>().unwrap(), vec![-5, -5, -5, -5]);
    }

    #[test]
    fn test_window_larger_than_input() {
        let rt = Runtime::host().unwrap();
        let params = MaxPoolParams {
            filter: (8, 8),
            android_nn: true,
            ..MaxPoolParams::default()
        };
        let err = pool(&rt, PrecisionType::Fp32, ramp(&rt), &params).err().unwrap();
        assert!(matches!(err, RuntimeError::ShapeInference { .. }));
    }
}
