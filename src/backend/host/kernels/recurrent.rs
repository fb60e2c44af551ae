//! LSTM step kernels: gate projection, cell update, output update.
//!
//! Gates are laid out `[batch, 4 * units]` in the order input, forget,
//! cell candidate, output.

use std::collections::HashMap;

use half::f16;

use super::sigmoid;
use crate::backend::host::launch::{HostLaunch, Variant};
use crate::backend::host::table::Family;
use crate::element::Element;
use crate::error::RuntimeError;
use crate::kernel::ArgKind::{self, Buffer, F32, U32};

/// input, input_weights, h_in, recurrent_weights, bias, gates,
/// batch, input_size, units
const GATE_PROJECTION: &[ArgKind] = &[
    Buffer, Buffer, Buffer, Buffer, Buffer, Buffer, U32, U32, U32,
];

/// gates, c_in, c_out, batch, units, cell_clip
const CELL_UPDATE: &[ArgKind] = &[Buffer, Buffer, Buffer, U32, U32, F32];

/// gates, c_out, h_out, batch, units
const OUTPUT_UPDATE: &[ArgKind] = &[Buffer, Buffer, Buffer, U32, U32];

pub(crate) fn register(table: &mut HashMap<String, Family>) {
    table.insert(
        "matrix_batch_vector_mul_with_bias".into(),
        Family::plain(GATE_PROJECTION, instantiate!(gate_projection => f32: f32, f16: f16)),
    );
    table.insert(
        "lstm_update_cell".into(),
        Family::plain(CELL_UPDATE, instantiate!(update_cell => f32: f32, f16: f16)),
    );
    table.insert(
        "lstm_update_output".into(),
        Family::plain(OUTPUT_UPDATE, instantiate!(update_output => f32: f32, f16: f16)),
    );
}

/// Grid `[4 * units, batch]`.
fn gate_projection<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let wi = l.load::<T>(1)?;
    let h = l.load::<T>(2)?;
    let wr = l.load::<T>(3)?;
    let bias = l.load::<T>(4)?;
    let mut gates = l.load::<T>(5)?;
    let batch = l.usize(6)?;
    let input_size = l.usize(7)?;
    let units = l.usize(8)?;

    for [g, b, _] in l.grid() {
        if g >= 4 * units || b >= batch {
            continue;
        }
        let mut acc = l.get(&bias, g)?.to_f32();
        for k in 0..input_size {
            acc += l.get(&input, b * input_size + k)?.to_f32()
                * l.get(&wi, g * input_size + k)?.to_f32();
        }
        for k in 0..units {
            acc += l.get(&h, b * units + k)?.to_f32() * l.get(&wr, g * units + k)?.to_f32();
        }
        l.set(&mut gates, b * 4 * units + g, T::from_f32(acc))?;
    }
    l.store(5, &gates)
}

/// Grid `[units, batch]`. A non-positive clip disables clipping.
fn update_cell<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let gates = l.load::<T>(0)?;
    let c_in = l.load::<T>(1)?;
    let mut c_out = l.load::<T>(2)?;
    let batch = l.usize(3)?;
    let units = l.usize(4)?;
    let clip = l.f32(5)?;

    for [u, b, _] in l.grid() {
        if u >= units || b >= batch {
            continue;
        }
        let row = b * 4 * units;
        let i = sigmoid(l.get(&gates, row + u)?.to_f32());
        let f = sigmoid(l.get(&gates, row + units + u)?.to_f32());
        let g = l.get(&gates, row + 2 * units + u)?.to_f32().tanh();
        let mut c = f * l.get(&c_in, b * units + u)?.to_f32() + i * g;
        if clip > 0.0 {
            c = c.clamp(-clip, clip);
        }
        l.set(&mut c_out, b * units + u, T::from_f32(c))?;
    }
    l.store(2, &c_out)
}

/// Grid `[units, batch]`.
fn update_output<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let gates = l.load::<T>(0)?;
    let c_out = l.load::<T>(1)?;
    let mut h_out = l.load::<T>(2)?;
    let batch = l.usize(3)?;
    let units = l.usize(4)?;

    for [u, b, _] in l.grid() {
        if u >= units || b >= batch {
            continue;
        }
        let o = sigmoid(l.get(&gates, b * 4 * units + 3 * units + u)?.to_f32());
        let c = l.get(&c_out, b * units + u)?.to_f32();
        l.set(&mut h_out, b * units + u, T::from_f32(o * c.tanh()))?;
    }
    l.store(2, &h_out)
}
