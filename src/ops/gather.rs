//! Gather along one axis.
//!
//! `out = in[.., indices[..], ..]`: the indexed axis is replaced by the
//! full shape of the indices tensor.

use std::sync::Arc;

use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelName};
use crate::ops::{
    apply_output_shape, check_output_shape, check_storage, normalize_axis, tensor_at, Lifecycle,
    Operator, OperatorBase, OperatorKind,
};
use crate::precision::PrecisionType;
use crate::runtime::Runtime;
use crate::tensor::{DataType, TensorRef};
use crate::worksize::{find_max_factor, WorkSize};

/// Inputs are `[input, indices]`; indices are `Int32`.
#[derive(Debug, Clone, Default)]
pub struct GatherParams {
    /// May be negative; counts from the last dimension.
    pub axis: i32,
    /// Infer the output shape and resize the output to it. When false the
    /// output must already have the inferred shape.
    pub android_nn: bool,
}

struct Bound {
    input: TensorRef,
    indices: TensorRef,
    output: TensorRef,
    axis: usize,
}

/// Select entries along one axis by index. Out-of-range indices read as
/// zero.
pub struct Gather {
    base: OperatorBase,
    bound: Option<Bound>,
}

/// Kernel name for a gather over `input_type` at `precision`.
///
/// Signed 8-bit wins over everything; an INT32 input overrides any other
/// declared precision except unsigned 8-bit.
pub fn kernel_name(precision: PrecisionType, input_type: DataType) -> KernelName {
    let name = KernelName::new("gather");
    if precision == PrecisionType::Int8 {
        name.signed(true)
    } else if input_type == DataType::Int32 && precision != PrecisionType::UInt8 {
        name.int32_input(true)
    } else {
        name
    }
}

/// `in[..axis] ++ indices ++ in[axis + 1..]`
pub fn output_dims(input: &[u32], indices: &[u32], axis: usize) -> Vec<u32> {
    let mut dims = Vec::with_capacity(input.len() + indices.len());
    dims.extend_from_slice(&input[..axis]);
    dims.extend_from_slice(indices);
    dims.extend_from_slice(&input[axis + 1..]);
    dims
}

impl Operator for Gather {
    type Params = GatherParams;
    const KIND: OperatorKind = OperatorKind::Gather;

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
        params: &GatherParams,
    ) -> Status {
        self.base.begin_initialize()?;
        let input = tensor_at(Self::KIND, inputs, 0, "input")?;
        let indices = tensor_at(Self::KIND, inputs, 1, "indices")?;
        let output = tensor_at(Self::KIND, outputs, 0, "output")?;

        if indices.data_type() != DataType::Int32 {
            return Err(RuntimeError::precondition(
                Self::KIND,
                format!("indices must be int32, got {}", indices.data_type()),
            ));
        }
        let precision = self.base.precision();
        let name = kernel_name(precision, input.data_type());
        if !name.is_int32_input() {
            check_storage(Self::KIND, &input, precision, "input")?;
        }
        if output.data_type() != input.data_type() {
            return Err(RuntimeError::precondition(
                Self::KIND,
                format!("output is {}, input is {}", output.data_type(), input.data_type()),
            ));
        }

        let in_dims = input.dims();
        let axis = normalize_axis(Self::KIND, params.axis, in_dims.len())?;
        let out_dims = output_dims(&in_dims, &indices.dims(), axis);
        check_output_shape(Self::KIND, &output, &out_dims, params.android_nn)?;

        let kernel = self.base.resolve(&name)?;
        apply_output_shape(&output, &out_dims, params.android_nn)?;

        self.bound = Some(Bound {
            input,
            indices,
            output,
            axis,
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

impl Gather {
    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        let dims = b.input.dims();
        let outer: u32 = dims[..b.axis].iter().product();
        let inner: u32 = dims[b.axis + 1..].iter().product();
        let axis_size = dims[b.axis];
        let count = b.indices.total_size() as u32;
        if outer == 0 || count == 0 {
            return Ok(());
        }

        let local = find_max_factor(count, self.base.cap());
        let work = WorkSize::two_d([outer, count], Some([1, local]));
        let args = KernelArgs::new()
            .buffer(&b.input)
            .buffer(&b.indices)
            .buffer(&b.output)
            .u32(inner)
            .u32(count)
            .u32(axis_size);
        self.base.enqueue(0, args, &work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorDesc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_output_dims() {
        assert_eq!(output_dims(&[4, 3, 2], &[5], 1), vec![4, 5, 2]);
        assert_eq!(output_dims(&[4, 3, 2], &[2, 2], 0), vec![2, 2, 3, 2]);
        assert_eq!(output_dims(&[4, 3, 2], &[1], 2), vec![4, 3, 1]);
    }

    #[test]
    fn test_kernel_name_priority() {
        let f = |p, t| kernel_name(p, t).with_precision(p);
        assert_eq!(f(PrecisionType::Fp32, DataType::Float32), "gather_FP32");
        assert_eq!(f(PrecisionType::Fp32, DataType::Int32), "INT32gather_FP32");
        assert_eq!(f(PrecisionType::Int8, DataType::Int32), "SIGNEDgather_INT8");
        assert_eq!(f(PrecisionType::UInt8, DataType::Int32), "gather_INT8");
    }

    #[test]
    fn test_gather_rows_on_axis_zero() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[3, 2], DataType::Float32)).unwrap();
        input.write(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let indices = rt.create_tensor(TensorDesc::new(&[2], DataType::Int32)).unwrap();
        indices.write(&[2i32, 0]).unwrap();
        let output = rt.create_tensor(TensorDesc::new(&[1], DataType::Float32)).unwrap();

        let mut op = Gather::new(Arc::clone(&rt), PrecisionType::Fp32);
        let params = GatherParams {
            axis: 0,
            android_nn: true,
        };
        op.initialize(&[input, indices], &[Arc::clone(&output)], &params)
            .unwrap();
        assert_eq!(output.dims(), vec![2, 2]);

        op.execute().unwrap();
        rt.finish().unwrap();
        assert_eq!(output.read::<f32>().unwrap(), vec![5.0, 6.0, 1.0, 2.0]);
        op.release().unwrap();
    }

    #[test]
    fn test_presized_output_is_validated() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[4, 3, 2], DataType::Float32)).unwrap();
        let indices = rt.create_tensor(TensorDesc::new(&[5], DataType::Int32)).unwrap();
        let wrong = rt.create_tensor(TensorDesc::new(&[4, 3, 2], DataType::Float32)).unwrap();
        let right = rt.create_tensor(TensorDesc::new(&[4, 5, 2], DataType::Float32)).unwrap();
        let params = GatherParams {
            axis: -2,
            android_nn: false,
        };

        let mut op = Gather::new(Arc::clone(&rt), PrecisionType::Fp32);
        let err = op
            .initialize(&[Arc::clone(&input), Arc::clone(&indices)], &[Arc::clone(&wrong)], &params)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Precondition { .. }));
        assert_eq!(wrong.dims(), vec![4, 3, 2]);
        assert_eq!(op.state(), Lifecycle::Created);

        op.initialize(&[input, indices], &[right], &params).unwrap();
        assert_eq!(op.kernel_names(), vec!["gather_FP32".to_string()]);
    }

    #[test]
    fn test_rejects_float_indices() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[4], DataType::Float32)).unwrap();
        let indices = rt.create_tensor(TensorDesc::new(&[2], DataType::Float32)).unwrap();
        let output = rt.create_tensor(TensorDesc::new(&[2], DataType::Float32)).unwrap();
        let mut op = Gather::new(rt, PrecisionType::Fp32);
        assert!(op
            .initialize(&[input, indices], &[output], &GatherParams::default())
            .is_err());
    }
}
