//! Elementwise kernels over NCHW planes.

use std::collections::HashMap;

use half::f16;

use crate::backend::host::launch::{HostLaunch, Variant};
use crate::backend::host::table::{Family, Signature};
use crate::element::Element;
use crate::error::RuntimeError;
use crate::kernel::ArgKind::{self, Buffer, F32, I32, U32};
use crate::worksize;

const VECTOR_WIDTH: usize = worksize::VECTOR_WIDTH as usize;

/// input, output, channels, height, width
const TANH_FLOAT: &[ArgKind] = &[Buffer, Buffer, U32, U32, U32];

/// ... + in_scale, in_zero_point, out_scale, out_zero_point, qmin, qmax
const TANH_QUANT: &[ArgKind] = &[Buffer, Buffer, U32, U32, U32, F32, I32, F32, I32, I32, I32];

/// input, scale, bias, output, channels, height, width, bias_term
const SCALE: &[ArgKind] = &[Buffer, Buffer, Buffer, Buffer, U32, U32, U32, U32];

pub(crate) fn register(table: &mut HashMap<String, Family>) {
    let mut tanh_family = Family::plain(
        TANH_FLOAT,
        instantiate!(tanh => f32: f32, f16: f16, u8: u8, i8: i8),
    );
    tanh_family.signature = Signature::ByQuantization {
        float: TANH_FLOAT,
        quantized: TANH_QUANT,
    };
    table.insert("tanh".into(), tanh_family);
    table.insert(
        "scale".into(),
        Family::plain(SCALE, instantiate!(scale => f32: f32, f16: f16)),
    );
}

struct Requantize {
    in_scale: f32,
    in_zero: f32,
    out_scale: f32,
    out_zero: f32,
    min: f32,
    max: f32,
}

impl Requantize {
    fn read(l: &HostLaunch<'_>) -> Result<Self, RuntimeError> {
        let out_scale = l.f32(7)?;
        if out_scale == 0.0 {
            return Err(l.fail("output scale is zero"));
        }
        Ok(Self {
            in_scale: l.f32(5)?,
            in_zero: l.i32(6)? as f32,
            out_scale,
            out_zero: l.i32(8)? as f32,
            min: l.i32(9)? as f32,
            max: l.i32(10)? as f32,
        })
    }

    fn apply(&self, raw: f32, f: impl Fn(f32) -> f32) -> f32 {
        let real = (raw - self.in_zero) * self.in_scale;
        ((f(real) / self.out_scale).round() + self.out_zero).clamp(self.min, self.max)
    }
}

fn tanh<T: Element>(l: &HostLaunch<'_>, v: &Variant) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let mut output = l.load::<T>(1)?;
    let channels = l.usize(2)?;
    let plane = l.usize(3)? * l.usize(4)?;
    let requant = if v.quantized() {
        Some(Requantize::read(l)?)
    } else {
        None
    };
    let vector = if requant.is_some() { 1 } else { VECTOR_WIDTH };

    for [n, c, item] in l.grid() {
        let base = (n * channels + c) * plane;
        for i in item * vector..((item + 1) * vector).min(plane) {
            let x = l.get(&input, base + i)?.to_f32();
            let y = match &requant {
                Some(q) => q.apply(x, f32::tanh),
                None => x.tanh(),
            };
            l.set(&mut output, base + i, T::from_f32(y))?;
        }
    }
    l.store(1, &output)
}

fn scale<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let scale = l.load::<T>(1)?;
    let bias = l.load::<T>(2)?;
    let mut output = l.load::<T>(3)?;
    let channels = l.usize(4)?;
    let plane = l.usize(5)? * l.usize(6)?;
    let bias_term = l.u32(7)? != 0;

    for [n, c, item] in l.grid() {
        let s = l.get(&scale, c)?.to_f32();
        let b = if bias_term { l.get(&bias, c)?.to_f32() } else { 0.0 };
        let base = (n * channels + c) * plane;
        for i in item * VECTOR_WIDTH..((item + 1) * VECTOR_WIDTH).min(plane) {
            let x = l.get(&input, base + i)?.to_f32();
            l.set(&mut output, base + i, T::from_f32(x * s + b))?;
        }
    }
    l.store(3, &output)
}
