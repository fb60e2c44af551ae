//! Data-movement kernels: gather, pad, slice, depth-to-space, dilation.

use std::collections::HashMap;

use half::f16;

use crate::backend::host::launch::{HostLaunch, Variant};
use crate::backend::host::table::Family;
use crate::element::Element;
use crate::error::RuntimeError;
use crate::kernel::ArgKind::{self, Buffer, F32, U32};
use crate::worksize::DEPTH_TO_SPACE_VECTOR;

/// input, indices, output, inner_size, indices_count, axis_size
const GATHER: &[ArgKind] = &[Buffer, Buffer, Buffer, U32, U32, U32];

/// input, output, in_n, in_c, in_h, in_w, out_c, out_h, out_w,
/// pad_n, pad_c, pad_h, pad_w, pad_value
const PAD: &[ArgKind] = &[
    Buffer, Buffer, U32, U32, U32, U32, U32, U32, U32, U32, U32, U32, U32, F32,
];

/// input, output, in_c, in_h, in_w, out_c, out_h, out_w, axis, offset
const SLICE: &[ArgKind] = &[Buffer, Buffer, U32, U32, U32, U32, U32, U32, U32, U32];

/// input, output, batch, in_c, in_h, in_w, block
const DEPTH_TO_SPACE: &[ArgKind] = &[Buffer, Buffer, U32, U32, U32, U32, U32];

/// output, count, fill
const FILL: &[ArgKind] = &[Buffer, U32, F32];

/// input, output, out_h, out_w, dilation_h, dilation_w, kernel_h, kernel_w
const DILATION: &[ArgKind] = &[Buffer, Buffer, U32, U32, U32, U32, U32, U32];

pub(crate) fn register(table: &mut HashMap<String, Family>) {
    table.insert(
        "gather".into(),
        Family::plain(
            GATHER,
            instantiate!(gather => f32: f32, f16: f16, u8: u8, i8: i8, i32: i32),
        ),
    );
    table.insert(
        "pad".into(),
        Family::plain(PAD, instantiate!(pad => f32: f32, f16: f16, u8: u8, i8: i8)),
    );
    table.insert(
        "slice_NC".into(),
        Family::plain(SLICE, instantiate!(slice_nc => f32: f32, f16: f16, u8: u8, i8: i8)),
    );
    table.insert(
        "slice_HW".into(),
        Family::plain(SLICE, instantiate!(slice_hw => f32: f32, f16: f16, u8: u8, i8: i8)),
    );
    table.insert(
        "depth_to_space".into(),
        Family::plain(
            DEPTH_TO_SPACE,
            instantiate!(depth_to_space => f32: f32, f16: f16, u8: u8, i8: i8),
        ),
    );
    table.insert(
        "depth_to_space_opt_vload".into(),
        Family::plain(
            DEPTH_TO_SPACE,
            instantiate!(depth_to_space_vload => f32: f32, f16: f16, u8: u8),
        ),
    );
    table.insert(
        "dilation_init".into(),
        Family::plain(FILL, instantiate!(fill => f32: f32, f16: f16, u8: u8, i8: i8)),
    );
    table.insert(
        "dilation".into(),
        Family::plain(DILATION, instantiate!(dilation => f32: f32, f16: f16, u8: u8, i8: i8)),
    );
}

fn gather<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let indices = l.load::<i32>(1)?;
    let mut output = l.load::<T>(2)?;
    let inner = l.usize(3)?;
    let count = l.usize(4)?;
    let axis_size = l.usize(5)?;

    for [outer, j, _] in l.grid() {
        if j >= count {
            continue;
        }
        let dst = (outer * count + j) * inner;
        let index = l.get(&indices, j)?;
        if index < 0 || index as usize >= axis_size {
            for i in 0..inner {
                l.set(&mut output, dst + i, T::default())?;
            }
            continue;
        }
        let src = (outer * axis_size + index as usize) * inner;
        for i in 0..inner {
            let v = l.get(&input, src + i)?;
            l.set(&mut output, dst + i, v)?;
        }
    }
    l.store(2, &output)
}

fn pad<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let mut output = l.load::<T>(1)?;
    let [in_n, in_c, in_h, in_w] = [l.u32(2)?, l.u32(3)?, l.u32(4)?, l.u32(5)?].map(|v| v as i64);
    let out_c = l.usize(6)?;
    let out_h = l.usize(7)?;
    let out_w = l.usize(8)?;
    let [pn, pc, ph, pw] = [l.u32(9)?, l.u32(10)?, l.u32(11)?, l.u32(12)?].map(|v| v as i64);
    let fill = T::from_f32(l.f32(13)?);

    for [n, c, hw] in l.grid() {
        if c >= out_c || hw >= out_h * out_w {
            continue;
        }
        let (y, x) = (hw / out_w, hw % out_w);
        let (sn, sc, sy, sx) = (n as i64 - pn, c as i64 - pc, y as i64 - ph, x as i64 - pw);
        let inside = (0..in_n).contains(&sn)
            && (0..in_c).contains(&sc)
            && (0..in_h).contains(&sy)
            && (0..in_w).contains(&sx);
        let value = if inside {
            l.get(&input, (((sn * in_c + sc) * in_h + sy) * in_w + sx) as usize)?
        } else {
            fill
        };
        l.set(&mut output, ((n * out_c + c) * out_h + y) * out_w + x, value)?;
    }
    l.store(1, &output)
}

struct SliceGeometry {
    in_c: usize,
    in_h: usize,
    in_w: usize,
    out_c: usize,
    out_h: usize,
    out_w: usize,
    axis: usize,
    offset: usize,
}

impl SliceGeometry {
    fn read(l: &HostLaunch<'_>) -> Result<Self, RuntimeError> {
        Ok(Self {
            in_c: l.usize(2)?,
            in_h: l.usize(3)?,
            in_w: l.usize(4)?,
            out_c: l.usize(5)?,
            out_h: l.usize(6)?,
            out_w: l.usize(7)?,
            axis: l.usize(8)?,
            offset: l.usize(9)?,
        })
    }

    /// Source index of output coordinate (n, c, y, x).
    fn source(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        let mut src = [n, c, y, x];
        src[self.axis] += self.offset;
        ((src[0] * self.in_c + src[1]) * self.in_h + src[2]) * self.in_w + src[3]
    }
}

fn slice_nc<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let mut output = l.load::<T>(1)?;
    let g = SliceGeometry::read(l)?;
    let plane = g.out_h * g.out_w;

    for [n, c, hw] in l.grid() {
        if c >= g.out_c || hw >= plane {
            continue;
        }
        let (y, x) = (hw / g.out_w, hw % g.out_w);
        let v = l.get(&input, g.source(n, c, y, x))?;
        l.set(&mut output, (n * g.out_c + c) * plane + hw, v)?;
    }
    l.store(1, &output)
}

fn slice_hw<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let mut output = l.load::<T>(1)?;
    let g = SliceGeometry::read(l)?;

    for [nc, y, x] in l.grid() {
        if y >= g.out_h || x >= g.out_w {
            continue;
        }
        let (n, c) = (nc / g.out_c, nc % g.out_c);
        let v = l.get(&input, g.source(n, c, y, x))?;
        l.set(&mut output, (nc * g.out_h + y) * g.out_w + x, v)?;
    }
    l.store(1, &output)
}

struct DepthToSpace {
    batch: usize,
    in_c: usize,
    in_h: usize,
    in_w: usize,
    block: usize,
}

impl DepthToSpace {
    fn read(l: &HostLaunch<'_>) -> Result<Self, RuntimeError> {
        let block = l.usize(6)?;
        if block == 0 {
            return Err(l.fail("block size is zero"));
        }
        Ok(Self {
            batch: l.usize(2)?,
            in_c: l.usize(3)?,
            in_h: l.usize(4)?,
            in_w: l.usize(5)?,
            block,
        })
    }

    fn out_c(&self) -> usize {
        self.in_c / (self.block * self.block)
    }

    fn input_index(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        ((n * self.in_c + c) * self.in_h + y) * self.in_w + x
    }

    fn output_index(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        let (oh, ow) = (self.in_h * self.block, self.in_w * self.block);
        ((n * self.out_c() + c) * oh + y) * ow + x
    }
}

/// One work item per output (channel, y, x), looping over the batch.
fn depth_to_space<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let mut output = l.load::<T>(1)?;
    let d = DepthToSpace::read(l)?;
    let (out_c, b) = (d.out_c(), d.block);

    for [oc, oy, ox] in l.grid() {
        if oc >= out_c || oy >= d.in_h * b || ox >= d.in_w * b {
            continue;
        }
        let ic = oc + ((oy % b) * b + ox % b) * out_c;
        for n in 0..d.batch {
            let v = l.get(&input, d.input_index(n, ic, oy / b, ox / b))?;
            l.set(&mut output, d.output_index(n, oc, oy, ox), v)?;
        }
    }
    l.store(1, &output)
}

/// One work item per 8 consecutive input columns of one (channel, row).
fn depth_to_space_vload<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    const VECTOR: usize = DEPTH_TO_SPACE_VECTOR as usize;
    let input = l.load::<T>(0)?;
    let mut output = l.load::<T>(1)?;
    let d = DepthToSpace::read(l)?;
    let (out_c, b) = (d.out_c(), d.block);

    for [gx, iy, ic] in l.grid() {
        if iy >= d.in_h || ic >= d.in_c {
            continue;
        }
        let (oc, r) = (ic % out_c, ic / out_c);
        let (dy, dx) = (r / b, r % b);
        for ix in gx * VECTOR..((gx + 1) * VECTOR).min(d.in_w) {
            for n in 0..d.batch {
                let v = l.get(&input, d.input_index(n, ic, iy, ix))?;
                l.set(&mut output, d.output_index(n, oc, iy * b + dy, ix * b + dx), v)?;
            }
        }
    }
    l.store(1, &output)
}

fn fill<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let mut output = l.load::<T>(0)?;
    let count = l.usize(1)?;
    let value = T::from_f32(l.f32(2)?);
    for [i, _, _] in l.grid() {
        if i < count {
            l.set(&mut output, i, value)?;
        }
    }
    l.store(0, &output)
}

fn dilation<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let mut output = l.load::<T>(1)?;
    let out_h = l.usize(2)?;
    let out_w = l.usize(3)?;
    let dh = l.usize(4)?;
    let dw = l.usize(5)?;
    let kh = l.usize(6)?;
    let kw = l.usize(7)?;

    for [nc, y, x] in l.grid() {
        if y >= kh || x >= kw {
            continue;
        }
        let v = l.get(&input, (nc * kh + y) * kw + x)?;
        l.set(&mut output, (nc * out_h + y * dh) * out_w + x * dw, v)?;
    }
    l.store(1, &output)
}
