//! One LSTM time step.
//!
//! Three launches: the gate projection into a `[B, 4U]` scratch tensor,
//! the cell update, then the hidden-state update. Gate order is input,
//! forget, cell candidate, output.

use std::sync::Arc;

use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelName};
use crate::ops::{
    apply_output_shapes, check_output_shape, check_storage, tensor_at, Lifecycle, Operator,
    OperatorBase, OperatorKind,
};
use crate::precision::PrecisionType;
use crate::runtime::Runtime;
use crate::tensor::TensorRef;
use crate::worksize::{find_max_factor, WorkSize};

const INPUT: usize = 0;
const INPUT_WEIGHTS: usize = 1;
const RECURRENT_WEIGHTS: usize = 2;
const BIAS: usize = 3;
const HIDDEN_IN: usize = 4;
const CELL_IN: usize = 5;

const HIDDEN_OUT: usize = 0;
const CELL_OUT: usize = 1;
const GATES: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct LstmParams {
    /// Clamp the new cell state to `±cell_clip`. Zero or less disables it.
    pub cell_clip: f32,
    pub android_nn: bool,
}

struct Bound {
    inputs: Vec<TensorRef>,
    outputs: Vec<TensorRef>,
    batch: u32,
    input_size: u32,
    units: u32,
    cell_clip: f32,
}

/// Inputs are `[input, input weights, recurrent weights, bias, h_in, c_in]`
/// and outputs `[h_out, c_out, gates]`.
pub struct Lstm {
    base: OperatorBase,
    bound: Option<Bound>,
}

fn expect_dims(tensor: &TensorRef, dims: &[u32], role: &str) -> Status {
    if tensor.dims() != dims {
        return Err(RuntimeError::precondition(
            OperatorKind::Lstm,
            format!("{} is {:?}, expected {:?}", role, tensor.dims(), dims),
        ));
    }
    Ok(())
}

impl Operator for Lstm {
    type Params = LstmParams;
    const KIND: OperatorKind = OperatorKind::Lstm;

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
        params: &LstmParams,
    ) -> Status {
        self.base.begin_initialize()?;
        let roles = ["input", "input weights", "recurrent weights", "bias", "h_in", "c_in"];
        let ins = roles
            .iter()
            .enumerate()
            .map(|(i, role)| tensor_at(Self::KIND, inputs, i, role))
            .collect::<Result<Vec<_>, _>>()?;
        let outs = ["h_out", "c_out", "gates"]
            .iter()
            .enumerate()
            .map(|(i, role)| tensor_at(Self::KIND, outputs, i, role))
            .collect::<Result<Vec<_>, _>>()?;
        let precision = self.base.precision();
        for (t, role) in ins.iter().zip(roles) {
            check_storage(Self::KIND, t, precision, role)?;
        }

        let (batch, input_size) = match ins[INPUT].dims()[..] {
            [b, i] => (b, i),
            ref other => {
                return Err(RuntimeError::precondition(
                    Self::KIND,
                    format!("input must be [B, I], got {:?}", other),
                ))
            }
        };
        let units = match ins[RECURRENT_WEIGHTS].dims()[..] {
            [g, u] if g == 4 * u => u,
            ref other => {
                return Err(RuntimeError::precondition(
                    Self::KIND,
                    format!("recurrent weights must be [4U, U], got {:?}", other),
                ))
            }
        };
        expect_dims(&ins[INPUT_WEIGHTS], &[4 * units, input_size], "input weights")?;
        expect_dims(&ins[BIAS], &[4 * units], "bias")?;
        expect_dims(&ins[HIDDEN_IN], &[batch, units], "h_in")?;
        expect_dims(&ins[CELL_IN], &[batch, units], "c_in")?;

        let out_dims = [
            vec![batch, units],
            vec![batch, units],
            vec![batch, 4 * units],
        ];
        for ((t, dims), role) in outs.iter().zip(&out_dims).zip(["h_out", "c_out", "gates"]) {
            check_storage(Self::KIND, t, precision, role)?;
            check_output_shape(Self::KIND, t, dims, params.android_nn)?;
        }

        let kernels = [
            "matrix_batch_vector_mul_with_bias",
            "lstm_update_cell",
            "lstm_update_output",
        ]
        .iter()
        .map(|base| self.base.resolve(&KernelName::new(*base)))
        .collect::<Result<Vec<_>, _>>()?;
        apply_output_shapes(&outs, &out_dims, params.android_nn)?;

        self.bound = Some(Bound {
            inputs: ins,
            outputs: outs,
            batch,
            input_size,
            units,
            cell_clip: params.cell_clip,
        });
        self.base.finish_initialize(kernels);
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

impl Lstm {
    fn enqueue(&self) -> Status {
        let b = self
            .bound
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition(Self::KIND, "no tensors bound"))?;
        if b.batch == 0 || b.units == 0 {
            return Ok(());
        }
        let cap = self.base.cap();
        let (ins, outs) = (&b.inputs, &b.outputs);
        let gate_rows = 4 * b.units;

        let project = KernelArgs::new()
            .buffer(&ins[INPUT])
            .buffer(&ins[INPUT_WEIGHTS])
            .buffer(&ins[HIDDEN_IN])
            .buffer(&ins[RECURRENT_WEIGHTS])
            .buffer(&ins[BIAS])
            .buffer(&outs[GATES])
            .u32(b.batch)
            .u32(b.input_size)
            .u32(b.units);
        self.base.enqueue(
            0,
            project,
            &WorkSize::two_d([gate_rows, b.batch], Some([find_max_factor(gate_rows, cap), 1])),
        )?;

        let update = WorkSize::two_d([b.units, b.batch], Some([find_max_factor(b.units, cap), 1]));
        let cell = KernelArgs::new()
            .buffer(&outs[GATES])
            .buffer(&ins[CELL_IN])
            .buffer(&outs[CELL_OUT])
            .u32(b.batch)
            .u32(b.units)
            .f32(b.cell_clip);
        self.base.enqueue(1, cell, &update)?;

        let hidden = KernelArgs::new()
            .buffer(&outs[GATES])
            .buffer(&outs[CELL_OUT])
            .buffer(&outs[HIDDEN_OUT])
            .u32(b.batch)
            .u32(b.units);
        self.base.enqueue(2, hidden, &update)
    }
}
