//! Fully-connected kernels.

use std::collections::HashMap;

use half::f16;

use crate::backend::host::launch::{HostLaunch, Variant};
use crate::backend::host::table::Family;
use crate::element::Element;
use crate::error::RuntimeError;
use crate::kernel::ArgKind::{self, Buffer, U32};
use crate::worksize;

/// input, weight, bias, output, batch, inner (K), outputs (N), bias_term
const FC: &[ArgKind] = &[Buffer, Buffer, Buffer, Buffer, U32, U32, U32, U32];

const FC_BLOCK: usize = worksize::FC_BLOCK as usize;

pub(crate) fn register(table: &mut HashMap<String, Family>) {
    let fc_family = |kernels| Family::plain(FC, kernels).with_activation();
    table.insert("fc".into(), fc_family(instantiate!(fc => f32: f32, f16: f16)));
    table.insert(
        "fc_direct_opt".into(),
        fc_family(instantiate!(fc_direct => f32: f32, f16: f16)),
    );
    table.insert(
        "fc_8x1_gemv".into(),
        fc_family(instantiate!(fc_block8 => f32: f32, f16: f16)),
    );
    table.insert(
        "fc_splitopt_8x1".into(),
        fc_family(instantiate!(fc_block8 => f32: f32, f16: f16)),
    );
}

struct Fc<T> {
    input: Vec<T>,
    weight: Vec<T>,
    bias: Vec<T>,
    batch: usize,
    inner: usize,
    outputs: usize,
    bias_term: bool,
}

impl<T: Element> Fc<T> {
    fn read(l: &HostLaunch<'_>) -> Result<Self, RuntimeError> {
        Ok(Self {
            input: l.load(0)?,
            weight: l.load(1)?,
            bias: l.load(2)?,
            batch: l.usize(4)?,
            inner: l.usize(5)?,
            outputs: l.usize(6)?,
            bias_term: l.u32(7)? != 0,
        })
    }

    fn dot(&self, l: &HostLaunch<'_>, b: usize, n: usize) -> Result<f32, RuntimeError> {
        let mut acc = if self.bias_term {
            l.get(&self.bias, n)?.to_f32()
        } else {
            0.0
        };
        for k in 0..self.inner {
            let x = l.get(&self.input, b * self.inner + k)?.to_f32();
            let w = l.get(&self.weight, n * self.inner + k)?.to_f32();
            acc += x * w;
        }
        Ok(acc)
    }
}

/// Grid `[N, B]`.
fn fc<T: Element>(l: &HostLaunch<'_>, v: &Variant) -> Result<(), RuntimeError> {
    let fc = Fc::<T>::read(l)?;
    let mut output = l.load::<T>(3)?;
    for [n, b, _] in l.grid() {
        if n >= fc.outputs || b >= fc.batch {
            continue;
        }
        let y = v.activation().apply(fc.dot(l, b, n)?);
        l.set(&mut output, b * fc.outputs + n, T::from_f32(y))?;
    }
    l.store(3, &output)
}

/// Single-batch flat grid `[align(N, local)]`.
fn fc_direct<T: Element>(l: &HostLaunch<'_>, v: &Variant) -> Result<(), RuntimeError> {
    let fc = Fc::<T>::read(l)?;
    let mut output = l.load::<T>(3)?;
    for [n, _, _] in l.grid() {
        if n >= fc.outputs {
            continue;
        }
        let y = v.activation().apply(fc.dot(l, 0, n)?);
        l.set(&mut output, n, T::from_f32(y))?;
    }
    l.store(3, &output)
}

/// Grid `[ceil(N / 8), B]`, eight outputs per item.
fn fc_block8<T: Element>(l: &HostLaunch<'_>, v: &Variant) -> Result<(), RuntimeError> {
    let fc = Fc::<T>::read(l)?;
    let mut output = l.load::<T>(3)?;
    for [block, b, _] in l.grid() {
        if b >= fc.batch {
            continue;
        }
        for n in block * FC_BLOCK..((block + 1) * FC_BLOCK).min(fc.outputs) {
            let y = v.activation().apply(fc.dot(l, b, n)?);
            l.set(&mut output, b * fc.outputs + n, T::from_f32(y))?;
        }
    }
    l.store(3, &output)
}
