//! Convolution kernels.
//!
//! All strategies compute the same NCHW x OIHW convolution; they differ in
//! how a work item maps onto output elements.

use std::collections::HashMap;

use half::f16;

use crate::backend::host::launch::{HostLaunch, Variant};
use crate::backend::host::table::{ElementKernels, Family, HostKernelFn};
use crate::element::Element;
use crate::error::RuntimeError;
use crate::kernel::ArgKind::{self, Buffer, U32};
use crate::worksize::{self, BlockSize};

/// input, weight, bias, merge, output, batch, in_c, in_h, in_w,
/// out_c, out_h, out_w, kernel_h, kernel_w, stride_h, stride_w,
/// pad_top, pad_left, dilation_h, dilation_w, groups, bias_term
const CONV: &[ArgKind] = &[
    Buffer, Buffer, Buffer, Buffer, Buffer, U32, U32, U32, U32, U32, U32, U32, U32, U32, U32, U32,
    U32, U32, U32, U32, U32, U32,
];

const GEMM_CHANNEL_BLOCK: usize = worksize::GEMM_CHANNEL_BLOCK as usize;
const DILATED_COLUMN_BLOCK: usize = worksize::DILATED_COLUMN_BLOCK as usize;

/// Blocks the PowerVR kernels are built for.
const POWERVR_BLOCKS: [BlockSize; 4] = [
    BlockSize::new(1, 1, 1),
    BlockSize::new(2, 1, 1),
    BlockSize::new(2, 1, 2),
    BlockSize::new(2, 2, 1),
];

macro_rules! powervr_kernels {
    ($x:literal, $y:literal, $z:literal) => {
        ElementKernels {
            f32: Some(conv_powervr::<f32, $x, $y, $z> as HostKernelFn),
            f16: Some(conv_powervr::<f16, $x, $y, $z> as HostKernelFn),
            ..Default::default()
        }
    };
}

pub(crate) fn register(table: &mut HashMap<String, Family>) {
    let conv_family = |kernels| {
        Family::plain(CONV, kernels)
            .with_activation()
            .with_merge_add()
    };
    table.insert(
        "direct".into(),
        conv_family(instantiate!(conv_direct => f32: f32, f16: f16)),
    );
    table.insert(
        "conv11".into(),
        conv_family(instantiate!(conv_pointwise => f32: f32, f16: f16)),
    );
    table.insert(
        "conv11_stride2".into(),
        conv_family(instantiate!(conv_pointwise => f32: f32, f16: f16)),
    );
    table.insert(
        "gemmBlocked".into(),
        conv_family(instantiate!(conv_gemm_blocked => f32: f32, f16: f16)),
    );
    table.insert(
        "dilation_conv_k3d8p8_4x8".into(),
        conv_family(instantiate!(conv_dilated_rows => f32: f32, f16: f16)),
    );

    for block in POWERVR_BLOCKS {
        let kernels = match (block.x, block.y, block.z) {
            (2, 1, 1) => powervr_kernels!(2, 1, 1),
            (2, 1, 2) => powervr_kernels!(2, 1, 2),
            (2, 2, 1) => powervr_kernels!(2, 2, 1),
            _ => powervr_kernels!(1, 1, 1),
        };
        for is1x1 in [0, 1] {
            for src_depth in [1, 2, 4] {
                let stem = format!(
                    "powervr_is1x1{}_srcdepth{}{}",
                    is1x1,
                    src_depth,
                    block.token()
                );
                table.insert(stem, conv_family(kernels));
            }
        }
    }
}

struct Conv<T> {
    input: Vec<T>,
    weight: Vec<T>,
    bias: Vec<T>,
    merge: Vec<T>,
    batch: usize,
    in_c: usize,
    in_h: usize,
    in_w: usize,
    out_c: usize,
    out_h: usize,
    out_w: usize,
    kernel: [usize; 2],
    stride: [usize; 2],
    pad: [usize; 2],
    dilation: [usize; 2],
    groups: usize,
    bias_term: bool,
}

impl<T: Element> Conv<T> {
    fn read(l: &HostLaunch<'_>, v: &Variant) -> Result<Self, RuntimeError> {
        let groups = l.usize(20)?;
        if groups == 0 {
            return Err(l.fail("groups is zero"));
        }
        Ok(Self {
            input: l.load(0)?,
            weight: l.load(1)?,
            bias: l.load(2)?,
            merge: if v.merge_add() { l.load(3)? } else { Vec::new() },
            batch: l.usize(5)?,
            in_c: l.usize(6)?,
            in_h: l.usize(7)?,
            in_w: l.usize(8)?,
            out_c: l.usize(9)?,
            out_h: l.usize(10)?,
            out_w: l.usize(11)?,
            kernel: [l.usize(12)?, l.usize(13)?],
            stride: [l.usize(14)?, l.usize(15)?],
            pad: [l.usize(16)?, l.usize(17)?],
            dilation: [l.usize(18)?, l.usize(19)?],
            groups,
            bias_term: l.u32(21)? != 0,
        })
    }

    fn contains(&self, b: usize, oc: usize, oy: usize, ox: usize) -> bool {
        b < self.batch && oc < self.out_c && oy < self.out_h && ox < self.out_w
    }

    /// Compute and write one output element, epilogue included.
    fn point(
        &self,
        l: &HostLaunch<'_>,
        v: &Variant,
        output: &mut [T],
        b: usize,
        oc: usize,
        oy: usize,
        ox: usize,
    ) -> Result<(), RuntimeError> {
        let icg = self.in_c / self.groups;
        let ocg = (self.out_c / self.groups).max(1);
        let group = oc / ocg;
        let [kh, kw] = self.kernel;

        let mut acc = if self.bias_term {
            l.get(&self.bias, oc)?.to_f32()
        } else {
            0.0
        };
        for ic in 0..icg {
            let c = group * icg + ic;
            for ky in 0..kh {
                let y = (oy * self.stride[0] + ky * self.dilation[0]) as i64 - self.pad[0] as i64;
                if y < 0 || y >= self.in_h as i64 {
                    continue;
                }
                for kx in 0..kw {
                    let x =
                        (ox * self.stride[1] + kx * self.dilation[1]) as i64 - self.pad[1] as i64;
                    if x < 0 || x >= self.in_w as i64 {
                        continue;
                    }
                    let xi = ((b * self.in_c + c) * self.in_h + y as usize) * self.in_w + x as usize;
                    let wi = ((oc * icg + ic) * kh + ky) * kw + kx;
                    acc += l.get(&self.input, xi)?.to_f32() * l.get(&self.weight, wi)?.to_f32();
                }
            }
        }

        let out_index = ((b * self.out_c + oc) * self.out_h + oy) * self.out_w + ox;
        if v.merge_add() {
            acc += l.get(&self.merge, out_index)?.to_f32();
        }
        l.set(output, out_index, T::from_f32(v.activation().apply(acc)))
    }
}

/// Grid `[out_w, out_h, batch * out_c]`.
fn conv_direct<T: Element>(l: &HostLaunch<'_>, v: &Variant) -> Result<(), RuntimeError> {
    let conv = Conv::<T>::read(l, v)?;
    let mut output = l.load::<T>(4)?;
    for [ox, oy, bc] in l.grid() {
        let (b, oc) = (bc / conv.out_c.max(1), bc % conv.out_c.max(1));
        if conv.contains(b, oc, oy, ox) {
            conv.point(l, v, &mut output, b, oc, oy, ox)?;
        }
    }
    l.store(4, &output)
}

/// Grid `[out_h * out_w, out_c, batch]`.
fn conv_pointwise<T: Element>(l: &HostLaunch<'_>, v: &Variant) -> Result<(), RuntimeError> {
    let conv = Conv::<T>::read(l, v)?;
    let mut output = l.load::<T>(4)?;
    for [hw, oc, b] in l.grid() {
        let (oy, ox) = (hw / conv.out_w.max(1), hw % conv.out_w.max(1));
        if conv.contains(b, oc, oy, ox) {
            conv.point(l, v, &mut output, b, oc, oy, ox)?;
        }
    }
    l.store(4, &output)
}

/// Grid `[out_h * out_w, ceil(out_c / 4), batch]`.
fn conv_gemm_blocked<T: Element>(l: &HostLaunch<'_>, v: &Variant) -> Result<(), RuntimeError> {
    let conv = Conv::<T>::read(l, v)?;
    let mut output = l.load::<T>(4)?;
    for [hw, slice, b] in l.grid() {
        let (oy, ox) = (hw / conv.out_w.max(1), hw % conv.out_w.max(1));
        for oc in slice * GEMM_CHANNEL_BLOCK..(slice + 1) * GEMM_CHANNEL_BLOCK {
            if conv.contains(b, oc, oy, ox) {
                conv.point(l, v, &mut output, b, oc, oy, ox)?;
            }
        }
    }
    l.store(4, &output)
}

/// Grid `[out_w / 8, out_h, batch * out_c]`, eight columns per item.
fn conv_dilated_rows<T: Element>(l: &HostLaunch<'_>, v: &Variant) -> Result<(), RuntimeError> {
    let conv = Conv::<T>::read(l, v)?;
    let mut output = l.load::<T>(4)?;
    for [gx, oy, bc] in l.grid() {
        let (b, oc) = (bc / conv.out_c.max(1), bc % conv.out_c.max(1));
        for ox in gx * DILATED_COLUMN_BLOCK..(gx + 1) * DILATED_COLUMN_BLOCK {
            if conv.contains(b, oc, oy, ox) {
                conv.point(l, v, &mut output, b, oc, oy, ox)?;
            }
        }
    }
    l.store(4, &output)
}

/// Grid `[ceil(out_w * batch / X), ceil(out_h / Y), ceil(ceil(out_c / 4) / Z)]`.
/// Each item covers X columns (batch folded into width), Y rows and Z
/// four-channel slices.
fn conv_powervr<T: Element, const X: usize, const Y: usize, const Z: usize>(
    l: &HostLaunch<'_>,
    v: &Variant,
) -> Result<(), RuntimeError> {
    let conv = Conv::<T>::read(l, v)?;
    let mut output = l.load::<T>(4)?;
    let width = conv.out_w.max(1);
    for [gx, gy, gz] in l.grid() {
        for xn in gx * X..(gx + 1) * X {
            let (b, ox) = (xn / width, xn % width);
            for oy in gy * Y..(gy + 1) * Y {
                for slice in gz * Z..(gz + 1) * Z {
                    for oc in slice * 4..slice * 4 + 4 {
                        if conv.contains(b, oc, oy, ox) {
                            conv.point(l, v, &mut output, b, oc, oy, ox)?;
                        }
                    }
                }
            }
        }
    }
    l.store(4, &output)
}
