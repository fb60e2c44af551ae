//! Depth to space: move `block²` channel groups into spatial blocks.

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
use crate::worksize::{align_to, div_round_up, find_max_factor, WorkSize, DEPTH_TO_SPACE_VECTOR};

const VLOAD_LOCAL: u32 = 16;

#[derive(Debug, Clone, Default)]
pub struct Depth2SpaceParams {
    /// Side of the square block each group of channels unfolds into.
    /// Channels must divide by its square.
    pub block_size: u32,
    /// Infer the output shape and resize the output to it. When false the
    /// output must already have the inferred shape.
    pub android_nn: bool,
}

struct Bound {
    input: TensorRef,
    output: TensorRef,
    block: u32,
    vload: bool,
}

/// Move channel blocks into space: `[n, c, h, w]` becomes
/// `[n, c / b², h * b, w * b]`.
pub struct Depth2Space {
    base: OperatorBase,
    bound: Option<Bound>,
}

/// The vectorized kernel covers block 2 on a single batch.
pub fn kernel_name(precision: PrecisionType, block: u32, batch: u32) -> KernelName {
    if precision == PrecisionType::Int8 {
        KernelName::new("depth_to_space").signed(true)
    } else if block == 2 && batch == 1 {
        KernelName::new("depth_to_space").infix("_opt_vload")
    } else {
        KernelName::new("depth_to_space")
    }
}

impl Operator for Depth2Space {
    type Params = Depth2SpaceParams;
    const KIND: OperatorKind = OperatorKind::Depth2Space;

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
        params: &Depth2SpaceParams,
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

        let block = params.block_size;
        let [n, c, h, w] = nchw_of(Self::KIND, &input, "input")?;
        let area = block.checked_mul(block).filter(|&a| a > 0);
        let out_dims = area
            .filter(|&a| c % a == 0)
            .and_then(|a| Some([n, c / a, h.checked_mul(block)?, w.checked_mul(block)?]))
            .ok_or_else(|| {
                RuntimeError::shape(
                    Self::KIND,
                    format!("{} channels over {}x{} do not form blocks of {}", c, h, w, block),
                )
            })?;
        check_output_shape(Self::KIND, &output, &out_dims, params.android_nn)?;

        let name = kernel_name(precision, block, n);
        let vload = name.stem() == "depth_to_space_opt_vload";
        let kernel = self.base.resolve(&name)?;
        apply_output_shape(&output, &out_dims, params.android_nn)?;

        self.bound = Some(Bound {
            input,
            output,
            block,
            vload,
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

impl Depth2Space {
    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        let [n, c, h, w] = nchw_of(Self::KIND, &b.input, "input")?;
        if n * c * h * w == 0 {
            return Ok(());
        }
        let work = if b.vload {
            let columns = div_round_up(w, DEPTH_TO_SPACE_VECTOR);
            let local = self.base.local_size(VLOAD_LOCAL);
            WorkSize::three_d([align_to(columns, local), h, c], Some([local, 1, 1]))
        } else {
            let [_, oc, oh, ow] = nchw_of(Self::KIND, &b.output, "output")?;
            WorkSize::three_d([oc, oh, ow], Some([1, 1, find_max_factor(ow, self.base.cap())]))
        };
        let args = KernelArgs::new()
            .buffer(&b.input)
            .buffer(&b.output)
            .u32(n)
            .u32(c)
            .u32(h)
            .u32(w)
            .u32(b.block);
        self.base.enqueue(0, args, &work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, TensorDesc};
    use pretty_assertions::assert_eq;

    fn run(precision: PrecisionType, batch: u32) -> (Vec<String>, Vec<f32>, Vec<u32>) {
        let rt = Runtime::host().unwrap();
        let dt = precision.storage_type();
        let input = rt.create_tensor(TensorDesc::new(&[batch, 4, 1, 2], dt)).unwrap();
        let count = (batch * 8) as usize;
        match dt {
            DataType::Float32 => input.write(&(0..count).map(|v| v as f32).collect::<Vec<_>>()),
            _ => input.write(&(0..count).map(|v| v as i8).collect::<Vec<_>>()),
        }
        .unwrap();
        let output = rt.create_tensor(TensorDesc::new(&[1], dt)).unwrap();

        let mut op = Depth2Space::new(Arc::clone(&rt), precision);
        let params = Depth2SpaceParams {
            block_size: 2,
            android_nn: true,
        };
        op.initialize(&[input], &[Arc::clone(&output)], &params).unwrap();
        op.execute().unwrap();
        rt.finish().unwrap();
        (op.kernel_names(), output.read_f32().unwrap(), output.dims())
    }

    #[test]
    fn test_vectorized_path_for_single_batch() {
        let (names, values, dims) = run(PrecisionType::Fp32, 1);
        assert_eq!(names, vec!["depth_to_space_opt_vload_FP32".to_string()]);
        assert_eq!(dims, vec![1, 1, 2, 4]);
        // channel k holds offset (k / 2, k % 2) of each 2x2 block
        assert_eq!(values, vec![0.0, 2.0, 1.0, 3.0, 4.0, 6.0, 5.0, 7.0]);
    }

    #[test]
    fn test_generic_path_matches_vectorized() {
        let (names, values, _) = run(PrecisionType::Fp32, 2);
        assert_eq!(names, vec!["depth_to_space_FP32".to_string()]);
        assert_eq!(&values[..8], &[0.0, 2.0, 1.0, 3.0, 4.0, 6.0, 5.0, 7.0]);
        assert_eq!(&values[8..], &[8.0, 10.0, 9.0, 11.0, 12.0, 14.0, 13.0, 15.0]);
    }

    #[test]
    fn test_signed_path() {
        let (names, values, _) = run(PrecisionType::Int8, 1);
        assert_eq!(names, vec!["SIGNEDdepth_to_space_INT8".to_string()]);
        assert_eq!(values, vec![0.0, 2.0, 1.0, 3.0, 4.0, 6.0, 5.0, 7.0]);
    }
}
