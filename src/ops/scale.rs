//! Per-channel affine scale: `out = in * scale[c] + bias[c]`.

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
use crate::worksize::{align_to, vectorized_extent, WorkSize, VECTOR_WIDTH};

const LOCAL: u32 = 32;

#[derive(Debug, Clone, Default)]
pub struct ScaleParams {
    /// Add `inputs[2]` after scaling.
    pub bias_term: bool,
    pub android_nn: bool,
}

struct Bound {
    input: TensorRef,
    scale: TensorRef,
    bias: Option<TensorRef>,
    output: TensorRef,
}

/// Inputs are `[input, scale, bias?]`, scale and bias one value per channel.
pub struct Scale {
    base: OperatorBase,
    bound: Option<Bound>,
}

impl Operator for Scale {
    type Params = ScaleParams;
    const KIND: OperatorKind = OperatorKind::Scale;

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
        params: &ScaleParams,
    ) -> Status {
        self.base.begin_initialize()?;
        let input = tensor_at(Self::KIND, inputs, 0, "input")?;
        let scale = tensor_at(Self::KIND, inputs, 1, "scale")?;
        let bias = if params.bias_term {
            Some(tensor_at(Self::KIND, inputs, 2, "bias")?)
        } else {
            None
        };
        let output = tensor_at(Self::KIND, outputs, 0, "output")?;

        let precision = self.base.precision();
        check_storage(Self::KIND, &input, precision, "input")?;
        check_storage(Self::KIND, &scale, precision, "scale")?;
        check_storage(Self::KIND, &output, precision, "output")?;
        let [_, channels, _, _] = nchw_of(Self::KIND, &input, "input")?;
        let per_channel = [Some(&scale), bias.as_ref()];
        for t in per_channel.into_iter().flatten() {
            if t.total_size() != channels as usize {
                return Err(RuntimeError::precondition(
                    Self::KIND,
                    format!("expected {} per-channel values, got {:?}", channels, t.dims()),
                ));
            }
        }
        if let Some(b) = &bias {
            check_storage(Self::KIND, b, precision, "bias")?;
        }

        let dims = input.dims();
        check_output_shape(Self::KIND, &output, &dims, params.android_nn)?;
        let kernel = self.base.resolve(&KernelName::new("scale"))?;
        apply_output_shape(&output, &dims, params.android_nn)?;

        self.bound = Some(Bound {
            input,
            scale,
            bias,
            output,
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

impl Scale {
    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        let [n, c, h, w] = nchw_of(Self::KIND, &b.input, "input")?;
        if n * c * h * w == 0 {
            return Ok(());
        }
        let items = vectorized_extent(h * w, VECTOR_WIDTH);
        let local = self.base.local_size(LOCAL);
        let work = WorkSize::three_d([n, c, align_to(items, local)], Some([1, 1, local]));
        // the kernel ignores the bias buffer when bias_term is 0
        let bias = b.bias.as_ref().unwrap_or(&b.scale);
        let args = KernelArgs::new()
            .buffer(&b.input)
            .buffer(&b.scale)
            .buffer(bias)
            .buffer(&b.output)
            .u32(c)
            .u32(h)
            .u32(w)
            .u32(b.bias.is_some() as u32);
        self.base.enqueue(0, args, &work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, TensorDesc};
    use half::f16;

    #[test]
    fn test_scale_with_bias() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[1, 2, 1, 3], DataType::Float32)).unwrap();
        input.write(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let scale = rt.create_tensor(TensorDesc::new(&[2], DataType::Float32)).unwrap();
        scale.write(&[2.0f32, -1.0]).unwrap();
        let bias = rt.create_tensor(TensorDesc::new(&[2], DataType::Float32)).unwrap();
        bias.write(&[0.5f32, 10.0]).unwrap();
        let output = rt.create_tensor(TensorDesc::new(&[1, 2, 1, 3], DataType::Float32)).unwrap();

        let mut op = Scale::new(Arc::clone(&rt), PrecisionType::Fp32);
        let params = ScaleParams {
            bias_term: true,
            android_nn: false,
        };
        op.initialize(&[input, scale, bias], &[Arc::clone(&output)], &params)
            .unwrap();
        op.execute().unwrap();
        rt.finish().unwrap();
        assert_eq!(
            output.read::<f32>().unwrap(),
            vec![2.5, 4.5, 6.5, 6.0, 5.0, 4.0]
        );
    }

    #[test]
    fn test_half_precision_without_bias() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[1, 1, 2, 2], DataType::Float16)).unwrap();
        input
            .write(&[1.0f32, 2.0, 3.0, 4.0].map(f16::from_f32))
            .unwrap();
        let scale = rt.create_tensor(TensorDesc::new(&[1], DataType::Float16)).unwrap();
        scale.write(&[f16::from_f32(0.5)]).unwrap();
        let output = rt.create_tensor(TensorDesc::new(&[1, 1, 2, 2], DataType::Float16)).unwrap();

        let mut op = Scale::new(Arc::clone(&rt), PrecisionType::Fp16);
        op.initialize(&[input, scale], &[Arc::clone(&output)], &ScaleParams::default())
            .unwrap();
        assert_eq!(op.kernel_names(), vec!["scale_FP16".to_string()]);
        op.execute().unwrap();
        rt.finish().unwrap();
        assert_eq!(output.read_f32().unwrap(), vec![0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_quantized_scale_is_unresolvable() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[1, 1, 1, 2], DataType::UInt8)).unwrap();
        let scale = rt.create_tensor(TensorDesc::new(&[1], DataType::UInt8)).unwrap();
        let output = rt.create_tensor(TensorDesc::new(&[1, 1, 1, 2], DataType::UInt8)).unwrap();
        let mut op = Scale::new(rt, PrecisionType::UInt8);
        let err = op
            .initialize(&[input, scale], &[output], &ScaleParams::default())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Resolution { .. }));
        assert_eq!(op.state(), Lifecycle::Created);
    }
}
