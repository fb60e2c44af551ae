//! Host kernel table
//!
//! One entry per kernel stem. Each entry carries the parameter layout, the
//! prefixes it accepts, and one instantiation of the generic body per
//! element type. Name composition selects the entry; nothing is duplicated
//! per precision.

use std::collections::HashMap;

use super::launch::{ElementKind, HostLaunch, Variant};
use super::kernels;
use crate::error::RuntimeError;
use crate::kernel::ArgKind;

pub(crate) type HostKernelFn = fn(&HostLaunch<'_>, &Variant) -> Result<(), RuntimeError>;

#[derive(Clone, Copy)]
pub(crate) enum Signature {
    Fixed(&'static [ArgKind]),
    /// 8-bit variants take extra quantization scalars.
    ByQuantization {
        float: &'static [ArgKind],
        quantized: &'static [ArgKind],
    },
}

impl Signature {
    pub(crate) fn resolve(&self, quantized: bool) -> &'static [ArgKind] {
        match *self {
            Signature::Fixed(s) => s,
            Signature::ByQuantization { float, quantized: q } => {
                if quantized {
                    q
                } else {
                    float
                }
            }
        }
    }
}

#[derive(Clone, Copy, Default)]
pub(crate) struct ElementKernels {
    pub f32: Option<HostKernelFn>,
    pub f16: Option<HostKernelFn>,
    pub u8: Option<HostKernelFn>,
    pub i8: Option<HostKernelFn>,
    pub i32: Option<HostKernelFn>,
}

impl ElementKernels {
    pub(crate) fn get(&self, kind: ElementKind) -> Option<HostKernelFn> {
        match kind {
            ElementKind::F32 => self.f32,
            ElementKind::F16 => self.f16,
            ElementKind::U8 => self.u8,
            ElementKind::I8 => self.i8,
            ElementKind::I32 => self.i32,
        }
    }

    /// Registry names this entry answers to, without activation or merge
    /// prefixes.
    pub(crate) fn names(&self, stem: &str) -> Vec<String> {
        let mut out = Vec::new();
        if self.f32.is_some() {
            out.push(format!("{}_FP32", stem));
        }
        if self.f16.is_some() {
            out.push(format!("{}_FP16", stem));
        }
        if self.u8.is_some() {
            out.push(format!("{}_INT8", stem));
        }
        if self.i8.is_some() {
            out.push(format!("SIGNED{}_INT8", stem));
        }
        if self.i32.is_some() {
            out.push(format!("INT32{}_FP32", stem));
        }
        out
    }
}

#[derive(Clone, Copy)]
pub(crate) struct Family {
    pub signature: Signature,
    pub activation: bool,
    pub merge_add: bool,
    pub kernels: ElementKernels,
}

impl Family {
    pub(crate) fn plain(signature: &'static [ArgKind], kernels: ElementKernels) -> Self {
        Self {
            signature: Signature::Fixed(signature),
            activation: false,
            merge_add: false,
            kernels,
        }
    }

    pub(crate) fn with_activation(mut self) -> Self {
        self.activation = true;
        self
    }

    pub(crate) fn with_merge_add(mut self) -> Self {
        self.merge_add = true;
        self
    }
}

pub(crate) fn build() -> HashMap<String, Family> {
    let mut table = HashMap::new();
    kernels::movement::register(&mut table);
    kernels::elementwise::register(&mut table);
    kernels::pooling::register(&mut table);
    kernels::linear::register(&mut table);
    kernels::convolution::register(&mut table);
    kernels::recurrent::register(&mut table);
    table
}
