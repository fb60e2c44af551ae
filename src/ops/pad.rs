//! Constant padding.

use std::sync::Arc;

use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelName};
use crate::ops::{
    apply_output_shape, check_output_shape, check_storage, nchw_of, read_i32, tensor_at,
    Lifecycle, Operator, OperatorBase, OperatorKind,
};
use crate::precision::PrecisionType;
use crate::runtime::Runtime;
use crate::tensor::{DataType, Tensor, TensorRef};
use crate::worksize::{align_to, WorkSize};

/// Spatial work-group width of the float kernel.
const FLOAT_LOCAL: u32 = 32;

#[derive(Debug, Clone, Default)]
pub struct PadParams {
    /// Infer the output shape and resize the output to it. When false the
    /// output must already have the inferred shape.
    pub android_nn: bool,
    /// Paddings of a 4-D tensor arrive in NHWC order and are remapped to
    /// NCHW.
    pub paddings_nhwc: bool,
}

struct Bound {
    input: TensorRef,
    output: TensorRef,
    /// NCHW leading paddings.
    before: [u32; 4],
    value: f32,
}

/// Pad every axis with a constant.
///
/// Inputs are `[input, paddings, value?]`. Paddings hold a (before, after)
/// pair per axis; the value defaults to zero, or to the output zero point
/// for quantized tensors.
pub struct Pad {
    base: OperatorBase,
    bound: Option<Bound>,
}

/// Per-axis (before, after) pairs, remapped from NHWC when asked.
fn paddings(raw: &[i32], rank: usize, nhwc: bool) -> Result<Vec<(u32, u32)>, String> {
    if raw.len() != rank * 2 {
        return Err(format!(
            "paddings hold {} values, expected {} for rank {}",
            raw.len(),
            rank * 2,
            rank
        ));
    }
    if let Some(v) = raw.iter().find(|&&v| v < 0) {
        return Err(format!("negative padding {}", v));
    }
    let mut pairs: Vec<(u32, u32)> = raw
        .chunks(2)
        .map(|p| (p[0] as u32, p[1] as u32))
        .collect();
    if nhwc {
        if rank != 4 {
            return Err(format!("NHWC paddings need a 4-D input, got rank {}", rank));
        }
        // [n, h, w, c] -> [n, c, h, w]
        pairs = vec![pairs[0], pairs[3], pairs[1], pairs[2]];
    }
    Ok(pairs)
}

/// Value written outside the source window.
fn pad_value(
    value_tensor: Option<&TensorRef>,
    precision: PrecisionType,
    output: &Tensor,
) -> Result<f32, RuntimeError> {
    let raw = match value_tensor {
        Some(t) if t.data_type() == DataType::Int32 => t.read::<i32>()?.first().map(|&v| v as f32),
        Some(t) => t.read_f32()?.first().copied(),
        None => None,
    }
    .unwrap_or(0.0);
    if precision.is_quantized() && raw == 0.0 {
        let zero_point = output.quant().map(|q| q.zero_point).unwrap_or(0);
        return Ok(zero_point as f32);
    }
    Ok(raw)
}

impl Operator for Pad {
    type Params = PadParams;
    const KIND: OperatorKind = OperatorKind::Pad;

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
        params: &PadParams,
    ) -> Status {
        self.base.begin_initialize()?;
        let input = tensor_at(Self::KIND, inputs, 0, "input")?;
        let padding = tensor_at(Self::KIND, inputs, 1, "paddings")?;
        let output = tensor_at(Self::KIND, outputs, 0, "output")?;
        let precision = self.base.precision();
        check_storage(Self::KIND, &input, precision, "input")?;
        check_storage(Self::KIND, &output, precision, "output")?;

        let in_dims = input.dims();
        nchw_of(Self::KIND, &input, "input")?;
        let raw = read_i32(Self::KIND, &padding, "paddings")?;
        let pairs = paddings(&raw, in_dims.len(), params.paddings_nhwc)
            .map_err(|reason| RuntimeError::shape(Self::KIND, reason))?;
        let out_dims = in_dims
            .iter()
            .zip(&pairs)
            .map(|(&d, &(lo, hi))| {
                d.checked_add(lo).and_then(|v| v.checked_add(hi)).ok_or_else(|| {
                    RuntimeError::shape(
                        Self::KIND,
                        format!("axis of {} padded by ({}, {}) overflows", d, lo, hi),
                    )
                })
            })
            .collect::<Result<Vec<u32>, _>>()?;
        check_output_shape(Self::KIND, &output, &out_dims, params.android_nn)?;
        let value = pad_value(inputs.get(2), precision, &output)?;

        let name = KernelName::new("pad").signed(precision == PrecisionType::Int8);
        let kernel = self.base.resolve(&name)?;
        apply_output_shape(&output, &out_dims, params.android_nn)?;

        let mut before = [0u32; 4];
        for (slot, &(lo, _)) in before[4 - pairs.len()..].iter_mut().zip(&pairs) {
            *slot = lo;
        }
        self.bound = Some(Bound {
            input,
            output,
            before,
            value,
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

impl Pad {
    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        let [in_n, in_c, in_h, in_w] = nchw_of(Self::KIND, &b.input, "input")?;
        let [out_n, out_c, out_h, out_w] = nchw_of(Self::KIND, &b.output, "output")?;
        if out_n * out_c * out_h * out_w == 0 {
            return Ok(());
        }

        let local = if self.base.precision().is_float() {
            self.base.local_size(FLOAT_LOCAL)
        } else {
            1
        };
        let work = WorkSize::three_d(
            [out_n, out_c, align_to(out_h * out_w, local)],
            Some([1, 1, local]),
        );
        let [pn, pc, ph, pw] = b.before;
        let args = KernelArgs::new()
            .buffer(&b.input)
            .buffer(&b.output)
            .u32(in_n)
            .u32(in_c)
            .u32(in_h)
            .u32(in_w)
            .u32(out_c)
            .u32(out_h)
            .u32(out_w)
            .u32(pn)
            .u32(pc)
            .u32(ph)
            .u32(pw)
            .f32(b.value);
        self.base.enqueue(0, args, &work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorDesc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_nhwc_paddings_are_remapped() {
        let raw = [0, 0, 1, 2, 3, 4, 5, 6];
        assert_eq!(
            paddings(&raw, 4, true).unwrap(),
            vec![(0, 0), (5, 6), (1, 2), (3, 4)]
        );
        assert_eq!(paddings(&raw, 4, false).unwrap()[1], (1, 2));
        assert!(paddings(&raw[..4], 4, false).is_err());
        assert!(paddings(&[0, -1], 1, false).is_err());
    }

    #[test]
    fn test_pad_2d_plane() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[2, 2], DataType::Float32)).unwrap();
        input.write(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let padding = rt.create_tensor(TensorDesc::new(&[2, 2], DataType::Int32)).unwrap();
        padding.write(&[1i32, 0, 0, 1]).unwrap();
        let value = rt.create_tensor(TensorDesc::new(&[1], DataType::Float32)).unwrap();
        value.write(&[9.0f32]).unwrap();
        let output = rt.create_tensor(TensorDesc::new(&[1], DataType::Float32)).unwrap();

        let mut op = Pad::new(Arc::clone(&rt), PrecisionType::Fp32);
        let params = PadParams {
            android_nn: true,
            paddings_nhwc: false,
        };
        op.initialize(&[input, padding, value], &[Arc::clone(&output)], &params)
            .unwrap();
        assert_eq!(output.dims(), vec![3, 3]);
        op.execute().unwrap();
        rt.finish().unwrap();
        assert_eq!(
            output.read::<f32>().unwrap(),
            vec![9.0, 9.0, 9.0, 1.0, 2.0, 9.0, 3.0, 4.0, 9.0]
        );
    }

    #[test]
    fn test_quantized_pad_defaults_to_zero_point() {
        let rt = Runtime::host().unwrap();
        let input = rt
            .create_tensor(TensorDesc::new(&[1, 2], DataType::UInt8).quant(0.5, 7))
            .unwrap();
        input.write(&[10u8, 20]).unwrap();
        let padding = rt.create_tensor(TensorDesc::new(&[2, 2], DataType::Int32)).unwrap();
        padding.write(&[0i32, 0, 1, 1]).unwrap();
        let output = rt
            .create_tensor(TensorDesc::new(&[1, 4], DataType::UInt8).quant(0.5, 7))
            .unwrap();

        let mut op = Pad::new(Arc::clone(&rt), PrecisionType::UInt8);
        op.initialize(&[input, padding], &[Arc::clone(&output)], &PadParams::default())
            .unwrap();
        assert_eq!(op.kernel_names(), vec!["pad_INT8".to_string()]);
        op.execute().unwrap();
        rt.finish().unwrap();
        assert_eq!(output.read::<u8>().unwrap(), vec![7, 10, 20, 7]);
    }
}
