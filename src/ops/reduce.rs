//! Reduction over a set of axes.

use std::sync::Arc;

use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelName};
use crate::ops::{
    apply_output_shape, check_output_shape, check_storage, nchw_of, normalize_axis, read_i32,
    tensor_at, Lifecycle, Operator, OperatorBase, OperatorKind,
};
use crate::precision::PrecisionType;
use crate::runtime::Runtime;
use crate::tensor::{element_count, TensorRef};
use crate::worksize::{align_to, find_max_factor, WorkSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reducer {
    #[default]
    Sum,
    Min,
    Max,
    Prod,
    /// 1 when every element is non-zero.
    All,
    /// 1 when any element is non-zero.
    Any,
}

impl Reducer {
    pub fn token(self) -> &'static str {
        match self {
            Reducer::Sum => "SUM",
            Reducer::Min => "MIN",
            Reducer::Max => "MAX",
            Reducer::Prod => "PROD",
            Reducer::All => "ALL",
            Reducer::Any => "ANY",
        }
    }

    pub fn identity(self) -> f32 {
        match self {
            Reducer::Sum | Reducer::Any => 0.0,
            Reducer::Prod | Reducer::All => 1.0,
            Reducer::Min => f32::INFINITY,
            Reducer::Max => f32::NEG_INFINITY,
        }
    }

    pub fn combine(self, acc: f32, x: f32) -> f32 {
        let truth = |b: bool| if b { 1.0 } else { 0.0 };
        match self {
            Reducer::Sum => acc + x,
            Reducer::Prod => acc * x,
            Reducer::Min => acc.min(x),
            Reducer::Max => acc.max(x),
            Reducer::All => truth(acc != 0.0 && x != 0.0),
            Reducer::Any => truth(acc != 0.0 || x != 0.0),
        }
    }

    pub fn kernel_name(self, precision: PrecisionType) -> KernelName {
        KernelName::new(format!("{}_reduce", self.token()))
            .signed(precision == PrecisionType::Int8)
    }
}

/// Inputs are `[input, axes]`, the axes as an `Int32` tensor.
#[derive(Debug, Clone, Default)]
pub struct ReduceParams {
    pub reducer: Reducer,
    /// Keep reduced axes as extent 1 instead of dropping them.
    pub keep_dims: bool,
    pub android_nn: bool,
}

struct Bound {
    input: TensorRef,
    output: TensorRef,
    /// Reduced axes as bits over the NCHW view.
    mask: u32,
}

pub struct Reduce {
    base: OperatorBase,
    bound: Option<Bound>,
}

/// Normalized, sorted, deduplicated axes. Empty means every axis.
pub fn normalize_axes(raw: &[i32], rank: usize) -> Result<Vec<usize>, RuntimeError> {
    if raw.is_empty() {
        return Ok((0..rank).collect());
    }
    let mut axes = raw
        .iter()
        .map(|&a| normalize_axis(OperatorKind::Reduce, a, rank))
        .collect::<Result<Vec<_>, _>>()?;
    axes.sort_unstable();
    axes.dedup();
    Ok(axes)
}

pub fn output_dims(in_dims: &[u32], axes: &[usize], keep_dims: bool) -> Vec<u32> {
    let dims: Vec<u32> = in_dims
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| match (axes.contains(&i), keep_dims) {
            (false, _) => Some(d),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect();
    if dims.is_empty() {
        vec![1]
    } else {
        dims
    }
}

impl Operator for Reduce {
    type Params = ReduceParams;
    const KIND: OperatorKind = OperatorKind::Reduce;

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
        params: &ReduceParams,
    ) -> Status {
        self.base.begin_initialize()?;
        let input = tensor_at(Self::KIND, inputs, 0, "input")?;
        let axes_tensor = tensor_at(Self::KIND, inputs, 1, "axes")?;
        let output = tensor_at(Self::KIND, outputs, 0, "output")?;
        let precision = self.base.precision();
        check_storage(Self::KIND, &input, precision, "input")?;
        check_storage(Self::KIND, &output, precision, "output")?;
        nchw_of(Self::KIND, &input, "input")?;

        let in_dims = input.dims();
        let rank = in_dims.len();
        let axes = normalize_axes(&read_i32(Self::KIND, &axes_tensor, "axes")?, rank)?;
        let out_dims = output_dims(&in_dims, &axes, params.keep_dims);
        check_output_shape(Self::KIND, &output, &out_dims, params.android_nn)?;

        let kernel = self.base.resolve(&params.reducer.kernel_name(precision))?;
        apply_output_shape(&output, &out_dims, params.android_nn)?;

        let mask = axes.iter().fold(0u32, |m, &a| m | 1 << (a + 4 - rank));
        log::debug!("Reduce {:?} over NCHW mask {:04b}", params.reducer, mask);
        self.bound = Some(Bound {
            input,
            output,
            mask,
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

impl Reduce {
    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        if b.input.total_size() == 0 {
            return Ok(());
        }
        let [d0, d1, d2, d3] = nchw_of(Self::KIND, &b.input, "input")?;
        let kept: Vec<u32> = [d0, d1, d2, d3]
            .iter()
            .enumerate()
            .filter(|&(a, _)| b.mask & (1 << a) == 0)
            .map(|(_, &d)| d)
            .collect();
        let out_count = element_count(&kept) as u32;
        let local = find_max_factor(out_count, self.base.cap());
        let work = WorkSize::one_d(align_to(out_count, local), Some(local));
        let args = KernelArgs::new()
            .buffer(&b.input)
            .buffer(&b.output)
            .u32(d0)
            .u32(d1)
            .u32(d2)
            .u32(d3)
            .u32(b.mask);
        self.base.enqueue(0, args, &work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, TensorDesc};
    use pretty_assertions::assert_eq;

    fn run_reduce(
        rt: &Arc<Runtime>,
        precision: PrecisionType,
        input: TensorRef,
        axes: &[i32],
        params: ReduceParams,
    ) -> Result<(Reduce, TensorRef), RuntimeError> {
        let axes_tensor = rt.create_tensor(TensorDesc::new(&[axes.len() as u32], DataType::Int32))?;
        axes_tensor.write(axes)?;
        let output = rt.create_tensor(TensorDesc::new(&[1], precision.storage_type()))?;
        let mut op = Reduce::new(Arc::clone(rt), precision);
        op.initialize(&[input, axes_tensor], &[Arc::clone(&output)], &params)?;
        op.execute()?;
        rt.finish()?;
        Ok((op, output))
    }

    fn float_input(rt: &Arc<Runtime>) -> TensorRef {
        let input = rt.create_tensor(TensorDesc::new(&[2, 3], DataType::Float32)).unwrap();
        input.write(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        input
    }

    #[test]
    fn test_axes_are_normalized() {
        assert_eq!(normalize_axes(&[-1, 0, 3, 0], 4).unwrap(), vec![0, 3]);
        assert_eq!(normalize_axes(&[], 3).unwrap(), vec![0, 1, 2]);
        assert!(normalize_axes(&[4], 4).is_err());
    }

    #[test]
    fn test_output_dims() {
        assert_eq!(output_dims(&[2, 3, 4], &[1], false), vec![2, 4]);
        assert_eq!(output_dims(&[2, 3, 4], &[1], true), vec![2, 1, 4]);
        assert_eq!(output_dims(&[2, 3], &[0, 1], false), vec![1]);
    }

    #[test]
    fn test_sum_over_last_axis() {
        let rt = Runtime::host().unwrap();
        let params = ReduceParams {
            android_nn: true,
            ..ReduceParams::default()
        };
        let (op, out) = run_reduce(&rt, PrecisionType::Fp32, float_input(&rt), &[1], params).unwrap();
        assert_eq!(op.kernel_names(), vec!["SUM_reduce_FP32".to_string()]);
        assert_eq!(out.dims(), vec![2]);
        assert_eq!(out.read::<f32>().unwrap(), vec![6.0, 15.0]);
    }

    #[test]
    fn test_max_keeps_dims() {
        let rt = Runtime::host().unwrap();
        let params = ReduceParams {
            reducer: Reducer::Max,
            keep_dims: true,
            android_nn: true,
        };
        let (_, out) = run_reduce(&rt, PrecisionType::Fp32, float_input(&rt), &[-2], params).unwrap();
        assert_eq!(out.dims(), vec![1, 3]);
        assert_eq!(out.read::<f32>().unwrap(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_empty_axes_reduce_everything() {
        let rt = Runtime::host().unwrap();
        let params = ReduceParams {
            reducer: Reducer::Prod,
            keep_dims: false,
            android_nn: true,
        };
        let (_, out) = run_reduce(&rt, PrecisionType::Fp32, float_input(&rt), &[], params).unwrap();
        assert_eq!(out.dims(), vec![1]);
        assert_eq!(out.read::<f32>().unwrap(), vec![720.0]);
    }

    #[test]
    fn test_any_and_all_on_bytes() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[2, 2], DataType::UInt8)).unwrap();
        input.write(&[0u8, 3, 0, 0]).unwrap();
        let any = ReduceParams {
            reducer: Reducer::Any,
            keep_dims: false,
            android_nn: true,
        };
        let (_, out) =
            run_reduce(&rt, PrecisionType::UInt8, Arc::clone(&input), &[1], any).unwrap();
        assert_eq!(out.read::<u8>().unwrap(), vec![1, 0]);

        let all = ReduceParams {
            reducer: Reducer::All,
            keep_dims: false,
            android_nn: true,
        };
        let (_, out) = run_reduce(&rt, PrecisionType::UInt8, input, &[0], all).unwrap();
        assert_eq!(out.read::<u8>().unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_signed_min() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[3], DataType::Int8)).unwrap();
        input.write(&[4i8, -7, 2]).unwrap();
        let params = ReduceParams {
            reducer: Reducer::Min,
            keep_dims: false,
            android_nn: true,
        };
        let (op, out) = run_reduce(&rt, PrecisionType::Int8, input, &[0], params).unwrap();
        assert_eq!(op.kernel_names(), vec!["SIGNEDMIN_reduce_INT8".to_string()]);
        assert_eq!(out.read::<i8>().unwrap(), vec![-7]);
    }

    #[test]
    fn test_signed_sum_is_unresolvable() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[3], DataType::Int8)).unwrap();
        let params = ReduceParams {
            android_nn: true,
            ..ReduceParams::default()
        };
        let err = run_reduce(&rt, PrecisionType::Int8, input, &[0], params)
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::Resolution { .. }));
    }

    #[test]
    fn test_presized_output_must_match() {
        let rt = Runtime::host().unwrap();
        let err = run_reduce(
            &rt,
            PrecisionType::Fp32,
            float_input(&rt),
            &[0],
            ReduceParams::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RuntimeError::Precondition { .. }));
    }
}
