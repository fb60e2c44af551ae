//! Hyperbolic tangent.
//!
//! Float variants process eight elements per work item. Quantized variants
//! dequantize with the input parameters and requantize with the output
//! parameters, one element per item.

use std::sync::Arc;

use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelName};
use crate::ops::{
    apply_output_shape, check_output_shape, check_storage, nchw_of, tensor_at, Lifecycle,
    Operator, OperatorBase, OperatorKind,
};
use crate::precision::PrecisionType;
use crate::runtime::Runtime;
use crate::tensor::{QuantParams, TensorRef};
use crate::worksize::{align_to, vectorized_extent, WorkSize, VECTOR_WIDTH};

const LOCAL: u32 = 32;

#[derive(Debug, Clone, Default)]
pub struct TanhParams {
    pub android_nn: bool,
}

struct Bound {
    input: TensorRef,
    output: TensorRef,
    quant: Option<(QuantParams, QuantParams)>,
}

/// Element-wise hyperbolic tangent.
pub struct Tanh {
    base: OperatorBase,
    bound: Option<Bound>,
}

impl Operator for Tanh {
    type Params = TanhParams;
    const KIND: OperatorKind = OperatorKind::Tanh;

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
        params: &TanhParams,
    ) -> Status {
        self.base.begin_initialize()?;
        let input = tensor_at(Self::KIND, inputs, 0, "input")?;
        let output = tensor_at(Self::KIND, outputs, 0, "output")?;
        let precision = self.base.precision();
        check_storage(Self::KIND, &input, precision, "input")?;
        check_storage(Self::KIND, &output, precision, "output")?;
        nchw_of(Self::KIND, &input, "input")?;

        let quant = if precision.is_quantized() {
            let q_in = input.quant().unwrap_or_default();
            let q_out = output.quant().unwrap_or_default();
            if q_out.scale == 0.0 {
                return Err(RuntimeError::precondition(Self::KIND, "output scale is zero"));
            }
            Some((q_in, q_out))
        } else {
            None
        };

        let dims = input.dims();
        check_output_shape(Self::KIND, &output, &dims, params.android_nn)?;
        let name = KernelName::new("tanh").signed(precision == PrecisionType::Int8);
        let kernel = self.base.resolve(&name)?;
        apply_output_shape(&output, &dims, params.android_nn)?;

        self.bound = Some(Bound {
            input,
            output,
            quant,
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

impl Tanh {
    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        if b.input.total_size() == 0 {
            log::debug!("Tanh: empty input, nothing to enqueue");
            return Ok(());
        }
        let [n, c, h, w] = nchw_of(Self::KIND, &b.input, "input")?;
        let plane = h * w;
        let items = match b.quant {
            Some(_) => plane,
            None => vectorized_extent(plane, VECTOR_WIDTH),
        };
        let local = self.base.local_size(LOCAL);
        let work = WorkSize::three_d([n, c, align_to(items, local)], Some([1, 1, local]));

        let mut args = KernelArgs::new()
            .buffer(&b.input)
            .buffer(&b.output)
            .u32(c)
            .u32(h)
            .u32(w);
        if let Some((q_in, q_out)) = b.quant {
            let (qmin, qmax) = self.base.precision().quant_range();
            args = args
                .f32(q_in.scale)
                .i32(q_in.zero_point)
                .f32(q_out.scale)
                .i32(q_out.zero_point)
                .i32(qmin)
                .i32(qmax);
        }
        self.base.enqueue(0, args, &work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, TensorDesc};

    #[test]
    fn test_float_tanh() {
        let rt = Runtime::host().unwrap();
        let values: Vec<f32> = (0..20).map(|i| i as f32 * 0.25 - 2.5).collect();
        let input = rt.create_tensor(TensorDesc::new(&[1, 2, 2, 5], DataType::Float32)).unwrap();
        input.write(&values).unwrap();
        let output = rt.create_tensor(TensorDesc::new(&[1, 2, 2, 5], DataType::Float32)).unwrap();

        let mut op = Tanh::new(Arc::clone(&rt), PrecisionType::Fp32);
        op.initialize(&[input], &[Arc::clone(&output)], &TanhParams::default())
            .unwrap();
        op.execute().unwrap();
        rt.finish().unwrap();

        let got = output.read::<f32>().unwrap();
        for (x, y) in values.iter().zip(&got) {
            assert!((x.tanh() - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_quantized_tanh_requantizes() {
        let rt = Runtime::host().unwrap();
        let input = rt
            .create_tensor(TensorDesc::new(&[4], DataType::UInt8).quant(0.1, 128))
            .unwrap();
        input.write(&[128u8, 138, 118, 255]).unwrap();
        let output = rt
            .create_tensor(TensorDesc::new(&[4], DataType::UInt8).quant(1.0 / 128.0, 128))
            .unwrap();

        let mut op = Tanh::new(Arc::clone(&rt), PrecisionType::UInt8);
        op.initialize(&[input], &[Arc::clone(&output)], &TanhParams::default())
            .unwrap();
        assert_eq!(op.kernel_names(), vec!["tanh_INT8".to_string()]);
        op.execute().unwrap();
        rt.finish().unwrap();

        // tanh(0) = 0, tanh(1) = 0.7616, tanh(-1) = -0.7616, tanh(12.7) ~ 1
        assert_eq!(output.read::<u8>().unwrap(), vec![128, 225, 31, 255]);
    }

    #[test]
    fn test_empty_input_enqueues_nothing() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[0, 4], DataType::Float32)).unwrap();
        let output = rt.create_tensor(TensorDesc::new(&[0, 4], DataType::Float32)).unwrap();
        let mut op = Tanh::new(Arc::clone(&rt), PrecisionType::Fp32);
        op.initialize(&[input], &[output], &TanhParams::default()).unwrap();
        op.execute().unwrap();
        rt.finish().unwrap();
        assert_eq!(rt.registry().stats().unwrap().compiled, 1);
    }
}
