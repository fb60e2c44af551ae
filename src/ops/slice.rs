//! Split one axis into consecutive slices, one per output.

use std::sync::Arc;

use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelName};
use crate::ops::{
    apply_output_shapes, check_storage, nchw_of, normalize_axis, tensor_at, Lifecycle, Operator,
    OperatorBase, OperatorKind,
};
use crate::precision::PrecisionType;
use crate::runtime::Runtime;
use crate::tensor::TensorRef;
use crate::worksize::{find_max_factor, WorkSize};

#[derive(Debug, Clone, Default)]
pub struct SliceParams {
    /// May be negative; counts from the last dimension.
    pub axis: i32,
    /// Start offsets of outputs 1..k along the axis. Empty means an even
    /// split.
    pub slice_points: Vec<u32>,
    pub android_nn: bool,
}

struct Bound {
    input: TensorRef,
    outputs: Vec<TensorRef>,
    /// Axis in the NCHW view.
    axis: usize,
    offsets: Vec<u32>,
}

pub struct Slice {
    base: OperatorBase,
    bound: Option<Bound>,
}

/// `(offset, extent)` of each output along an axis of length `dim`.
pub fn slice_ranges(dim: u32, points: &[u32], outputs: usize) -> Result<Vec<(u32, u32)>, String> {
    if outputs == 0 {
        return Err("slice needs at least one output".to_string());
    }
    let starts: Vec<u32> = if points.is_empty() {
        let step = dim / outputs as u32;
        if step * outputs as u32 != dim {
            return Err(format!("axis of {} does not split into {} parts", dim, outputs));
        }
        (0..outputs as u32).map(|i| i * step).collect()
    } else {
        if points.len() + 1 != outputs {
            return Err(format!(
                "{} slice points for {} outputs",
                points.len(),
                outputs
            ));
        }
        std::iter::once(0).chain(points.iter().copied()).collect()
    };

    let mut ranges = Vec::with_capacity(outputs);
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(dim);
        if end <= start || end > dim {
            return Err(format!("slice [{}, {}) invalid for axis of {}", start, end, dim));
        }
        ranges.push((start, end - start));
    }
    Ok(ranges)
}

impl Operator for Slice {
    type Params = SliceParams;
    const KIND: OperatorKind = OperatorKind::Slice;

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
        params: &SliceParams,
    ) -> Status {
        self.base.begin_initialize()?;
        let input = tensor_at(Self::KIND, inputs, 0, "input")?;
        tensor_at(Self::KIND, outputs, 0, "output")?;
        let precision = self.base.precision();
        check_storage(Self::KIND, &input, precision, "input")?;
        for (i, out) in outputs.iter().enumerate() {
            check_storage(Self::KIND, out, precision, &format!("output {}", i))?;
        }

        let in_dims = input.dims();
        nchw_of(Self::KIND, &input, "input")?;
        let axis = normalize_axis(Self::KIND, params.axis, in_dims.len())?;
        let ranges = slice_ranges(in_dims[axis], &params.slice_points, outputs.len())
            .map_err(|reason| RuntimeError::shape(Self::KIND, reason))?;

        let shapes: Vec<Vec<u32>> = ranges
            .iter()
            .map(|&(_, extent)| {
                let mut dims = in_dims.clone();
                dims[axis] = extent;
                dims
            })
            .collect();
        if !params.android_nn {
            for (i, (out, dims)) in outputs.iter().zip(&shapes).enumerate() {
                if out.dims() != *dims {
                    return Err(RuntimeError::precondition(
                        Self::KIND,
                        format!("output {} is {:?}, expected {:?}", i, out.dims(), dims),
                    ));
                }
            }
        }

        let axis4 = axis + 4 - in_dims.len();
        let base_name = if axis4 < 2 { "slice_NC" } else { "slice_HW" };
        let name = KernelName::new(base_name).signed(precision == PrecisionType::Int8);
        let kernel = self.base.resolve(&name)?;
        apply_output_shapes(outputs, &shapes, params.android_nn)?;

        self.bound = Some(Bound {
            input,
            outputs: outputs.to_vec(),
            axis: axis4,
            offsets: ranges.iter().map(|&(offset, _)| offset).collect(),
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

impl Slice {
    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        if b.input.total_size() == 0 {
            return Ok(());
        }
        let [_, in_c, in_h, in_w] = nchw_of(Self::KIND, &b.input, "input")?;
        let cap = self.base.cap();

        for (out, &offset) in b.outputs.iter().zip(&b.offsets) {
            let [n, c, h, w] = nchw_of(Self::KIND, out, "output")?;
            let work = if b.axis < 2 {
                let hw = h * w;
                WorkSize::three_d([n, c, hw], Some([1, 1, find_max_factor(hw, cap)]))
            } else {
                WorkSize::three_d([n * c, h, w], Some([1, 1, find_max_factor(w, cap)]))
            };
            let args = KernelArgs::new()
                .buffer(&b.input)
                .buffer(out)
                .u32(in_c)
                .u32(in_h)
                .u32(in_w)
                .u32(c)
                .u32(h)
                .u32(w)
                .u32(b.axis as u32)
                .u32(offset);
            self.base.enqueue(0, args, &work)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostAllocator;
    use crate::memory::{BufferAllocator, DeviceMemory};
    use crate::tensor::{DataType, Tensor, TensorDesc};
    use pretty_assertions::assert_eq;

    /// Host allocator that refuses to hold more than `budget` bytes.
    struct BudgetAllocator {
        inner: HostAllocator,
        budget: usize,
    }

    impl BufferAllocator for BudgetAllocator {
        fn allocate(&self, bytes: usize) -> Result<Arc<dyn DeviceMemory>, RuntimeError> {
            if self.inner.live_bytes() + bytes > self.budget {
                return Err(RuntimeError::Tensor(format!(
                    "budget of {} bytes exhausted",
                    self.budget
                )));
            }
            self.inner.allocate(bytes)
        }

        fn live_bytes(&self) -> usize {
            self.inner.live_bytes()
        }
    }

    #[test]
    fn test_slice_ranges() {
        assert_eq!(slice_ranges(6, &[], 3).unwrap(), vec![(0, 2), (2, 2), (4, 2)]);
        assert_eq!(slice_ranges(6, &[1, 4], 3).unwrap(), vec![(0, 1), (1, 3), (4, 2)]);
        assert!(slice_ranges(7, &[], 3).is_err());
        assert!(slice_ranges(6, &[4, 1], 3).is_err());
        assert!(slice_ranges(6, &[1], 3).is_err());
    }

    #[test]
    fn test_slice_channels() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[1, 3, 1, 2], DataType::Float32)).unwrap();
        input.write(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let a = rt.create_tensor(TensorDesc::new(&[1], DataType::Float32)).unwrap();
        let b = rt.create_tensor(TensorDesc::new(&[1], DataType::Float32)).unwrap();

        let mut op = Slice::new(Arc::clone(&rt), PrecisionType::Fp32);
        let params = SliceParams {
            axis: 1,
            slice_points: vec![1],
            android_nn: true,
        };
        op.initialize(&[input], &[Arc::clone(&a), Arc::clone(&b)], &params)
            .unwrap();
        assert_eq!(op.kernel_names(), vec!["slice_NC_FP32".to_string()]);
        op.execute().unwrap();
        rt.finish().unwrap();
        assert_eq!(a.read::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(b.read::<f32>().unwrap(), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_slice_width_evenly() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[2, 4], DataType::Int8)).unwrap();
        input.write(&[1i8, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let a = rt.create_tensor(TensorDesc::new(&[2, 2], DataType::Int8)).unwrap();
        let b = rt.create_tensor(TensorDesc::new(&[2, 2], DataType::Int8)).unwrap();

        let mut op = Slice::new(Arc::clone(&rt), PrecisionType::Int8);
        let params = SliceParams {
            axis: -1,
            ..SliceParams::default()
        };
        op.initialize(&[input], &[Arc::clone(&a), Arc::clone(&b)], &params)
            .unwrap();
        assert_eq!(op.kernel_names(), vec!["SIGNEDslice_HW_INT8".to_string()]);
        op.execute().unwrap();
        rt.finish().unwrap();
        assert_eq!(a.read::<i8>().unwrap(), vec![1, 2, 5, 6]);
        assert_eq!(b.read::<i8>().unwrap(), vec![3, 4, 7, 8]);
    }

    #[test]
    fn test_failed_allocation_leaves_every_output_unchanged() {
        let rt = Runtime::host().unwrap();
        let input = rt.create_tensor(TensorDesc::new(&[6], DataType::Float32)).unwrap();
        let alloc: Arc<dyn BufferAllocator> = Arc::new(BudgetAllocator {
            inner: HostAllocator::new(),
            budget: 20,
        });
        let a = Tensor::allocate(Arc::clone(&alloc), TensorDesc::new(&[1], DataType::Float32)).unwrap();
        let b = Tensor::allocate(Arc::clone(&alloc), TensorDesc::new(&[1], DataType::Float32)).unwrap();
        let a_buffer = a.buffer().id();

        // a's new 8 bytes fit the budget, b's 16 do not
        let mut op = Slice::new(Arc::clone(&rt), PrecisionType::Fp32);
        let params = SliceParams {
            axis: 0,
            slice_points: vec![2],
            android_nn: true,
        };
        let err = op
            .initialize(&[input], &[Arc::clone(&a), Arc::clone(&b)], &params)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Tensor(_)));
        assert_eq!(a.dims(), vec![1]);
        assert_eq!(b.dims(), vec![1]);
        assert_eq!(a.buffer().id(), a_buffer);
        assert_eq!(alloc.live_bytes(), 8);
        assert_eq!(op.state(), Lifecycle::Created);
    }
}
