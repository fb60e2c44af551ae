//! Window, reduction and resampling kernels.

use std::collections::HashMap;

use half::f16;

use crate::backend::host::launch::{HostLaunch, Variant};
use crate::backend::host::table::Family;
use crate::element::Element;
use crate::error::RuntimeError;
use crate::kernel::ArgKind::{self, Buffer, F32, U32};
use crate::ops::reduce::Reducer;
use crate::worksize;

/// input, output, in_h, in_w, out_h, out_w, filter_h, filter_w,
/// stride_h, stride_w, pad_top, pad_left
const MAXPOOL: &[ArgKind] = &[
    Buffer, Buffer, U32, U32, U32, U32, U32, U32, U32, U32, U32, U32,
];

/// input, output, dim0..dim3, reduced-axis mask
const REDUCE: &[ArgKind] = &[Buffer, Buffer, U32, U32, U32, U32, U32];

/// input, output, in_h, in_w, out_h, out_w, scale_h, scale_w, planes
const RESIZE: &[ArgKind] = &[Buffer, Buffer, U32, U32, U32, U32, F32, F32, U32];

const RESIZE_TILE: usize = worksize::RESIZE_TILE as usize;

pub(crate) fn register(table: &mut HashMap<String, Family>) {
    table.insert(
        "maxpooling".into(),
        Family::plain(MAXPOOL, instantiate!(maxpool => f32: f32, f16: f16, u8: u8, i8: i8))
            .with_activation(),
    );

    table.insert(
        "SUM_reduce".into(),
        Family::plain(REDUCE, instantiate!(reduce_sum => f32: f32, f16: f16)),
    );
    table.insert(
        "PROD_reduce".into(),
        Family::plain(REDUCE, instantiate!(reduce_prod => f32: f32, f16: f16)),
    );
    table.insert(
        "MIN_reduce".into(),
        Family::plain(REDUCE, instantiate!(reduce_min => f32: f32, f16: f16, u8: u8, i8: i8)),
    );
    table.insert(
        "MAX_reduce".into(),
        Family::plain(REDUCE, instantiate!(reduce_max => f32: f32, f16: f16, u8: u8, i8: i8)),
    );
    table.insert(
        "ALL_reduce".into(),
        Family::plain(REDUCE, instantiate!(reduce_all => f32: f32, f16: f16, u8: u8)),
    );
    table.insert(
        "ANY_reduce".into(),
        Family::plain(REDUCE, instantiate!(reduce_any => f32: f32, f16: f16, u8: u8)),
    );

    table.insert(
        "resize_bilinear".into(),
        Family::plain(RESIZE, instantiate!(resize_bilinear => f32: f32, f16: f16, u8: u8, i8: i8)),
    );
    table.insert(
        "resize_bilinear_tflite".into(),
        Family::plain(RESIZE, instantiate!(resize_bilinear => f32: f32, f16: f16)),
    );
    table.insert(
        "resize_bilinear_32_to_512".into(),
        Family::plain(RESIZE, instantiate!(resize_bilinear_tiled => u8: u8)),
    );
}

fn maxpool<T: Element>(l: &HostLaunch<'_>, v: &Variant) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let mut output = l.load::<T>(1)?;
    let [in_h, in_w, out_h, out_w] = [l.usize(2)?, l.usize(3)?, l.usize(4)?, l.usize(5)?];
    let [fh, fw, sh, sw] = [l.usize(6)?, l.usize(7)?, l.usize(8)?, l.usize(9)?];
    let [pt, pl] = [l.u32(10)? as i64, l.u32(11)? as i64];
    let channels = l.global()[1] as usize;
    let activation = v.activation();

    for [n, c, hw] in l.grid() {
        if hw >= out_h * out_w {
            continue;
        }
        let (oy, ox) = (hw / out_w, hw % out_w);
        let plane = (n * channels + c) * in_h * in_w;
        let y0 = (oy * sh) as i64 - pt;
        let x0 = (ox * sw) as i64 - pl;

        let mut best = f32::NEG_INFINITY;
        for ky in 0..fh as i64 {
            for kx in 0..fw as i64 {
                let (y, x) = (y0 + ky, x0 + kx);
                if y < 0 || x < 0 || y >= in_h as i64 || x >= in_w as i64 {
                    continue;
                }
                best = best.max(l.get(&input, plane + y as usize * in_w + x as usize)?.to_f32());
            }
        }
        let out_index = (n * channels + c) * out_h * out_w + hw;
        l.set(&mut output, out_index, T::from_f32(activation.apply(best)))?;
    }
    l.store(1, &output)
}

fn reduce_sum<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    reduce::<T>(l, Reducer::Sum)
}

fn reduce_prod<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    reduce::<T>(l, Reducer::Prod)
}

fn reduce_min<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    reduce::<T>(l, Reducer::Min)
}

fn reduce_max<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    reduce::<T>(l, Reducer::Max)
}

fn reduce_all<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    reduce::<T>(l, Reducer::All)
}

fn reduce_any<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    reduce::<T>(l, Reducer::Any)
}

/// One work item per output element; walks every reduced coordinate.
fn reduce<T: Element>(l: &HostLaunch<'_>, reducer: Reducer) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let mut output = l.load::<T>(1)?;
    let dims = [l.usize(2)?, l.usize(3)?, l.usize(4)?, l.usize(5)?];
    let mask = l.u32(6)?;
    let reduced = |axis: usize| mask & (1 << axis) != 0;

    let out_dims = std::array::from_fn::<usize, 4, _>(|a| if reduced(a) { 1 } else { dims[a] });
    let red_dims = std::array::from_fn::<usize, 4, _>(|a| if reduced(a) { dims[a] } else { 1 });
    let out_total: usize = out_dims.iter().product();
    let red_total: usize = red_dims.iter().product();

    for [o, _, _] in l.grid() {
        if o >= out_total {
            continue;
        }
        let base = unravel(o, &out_dims);
        let mut acc = reducer.identity();
        for r in 0..red_total {
            let offset = unravel(r, &red_dims);
            let coord: [usize; 4] = std::array::from_fn(|a| base[a] + offset[a]);
            let index = ((coord[0] * dims[1] + coord[1]) * dims[2] + coord[2]) * dims[3] + coord[3];
            acc = reducer.combine(acc, l.get(&input, index)?.to_f32());
        }
        l.set(&mut output, o, T::from_f32(acc))?;
    }
    l.store(1, &output)
}

fn unravel(mut index: usize, dims: &[usize; 4]) -> [usize; 4] {
    let mut coord = [0usize; 4];
    for a in (0..4).rev() {
        coord[a] = index % dims[a].max(1);
        index /= dims[a].max(1);
    }
    coord
}

struct Resize {
    in_h: usize,
    in_w: usize,
    out_h: usize,
    out_w: usize,
    scale_h: f32,
    scale_w: f32,
    planes: usize,
}

impl Resize {
    fn read(l: &HostLaunch<'_>) -> Result<Self, RuntimeError> {
        Ok(Self {
            in_h: l.usize(2)?,
            in_w: l.usize(3)?,
            out_h: l.usize(4)?,
            out_w: l.usize(5)?,
            scale_h: l.f32(6)?,
            scale_w: l.f32(7)?,
            planes: l.usize(8)?,
        })
    }

    fn sample<T: Element>(
        &self,
        l: &HostLaunch<'_>,
        input: &[T],
        plane: usize,
        oy: usize,
        ox: usize,
    ) -> Result<T, RuntimeError> {
        let (y0, y1, fy) = source_axis(oy, self.scale_h, self.in_h);
        let (x0, x1, fx) = source_axis(ox, self.scale_w, self.in_w);
        let base = plane * self.in_h * self.in_w;
        let at = |y: usize, x: usize| l.get(input, base + y * self.in_w + x).map(Element::to_f32);
        let top = at(y0, x0)? + (at(y0, x1)? - at(y0, x0)?) * fx;
        let bottom = at(y1, x0)? + (at(y1, x1)? - at(y1, x0)?) * fx;
        Ok(T::from_f32(top + (bottom - top) * fy))
    }
}

fn source_axis(o: usize, scale: f32, extent: usize) -> (usize, usize, f32) {
    let last = extent.saturating_sub(1);
    let src = (o as f32 * scale).clamp(0.0, last as f32);
    let i0 = (src.floor() as usize).min(last);
    let i1 = (i0 + 1).min(last);
    (i0, i1, src - i0 as f32)
}

/// Flat grid, one work item per output element.
fn resize_bilinear<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let mut output = l.load::<T>(1)?;
    let r = Resize::read(l)?;
    let plane_size = r.out_h * r.out_w;

    for [i, _, _] in l.grid() {
        if i >= r.planes * plane_size {
            continue;
        }
        let (plane, rem) = (i / plane_size, i % plane_size);
        let value = r.sample(l, &input, plane, rem / r.out_w, rem % r.out_w)?;
        l.set(&mut output, i, value)?;
    }
    l.store(1, &output)
}

/// Grid of `[tiles, RESIZE_TILE]`: each item fills one row of a 16x16
/// output tile.
fn resize_bilinear_tiled<T: Element>(l: &HostLaunch<'_>, _v: &Variant) -> Result<(), RuntimeError> {
    let input = l.load::<T>(0)?;
    let mut output = l.load::<T>(1)?;
    let r = Resize::read(l)?;
    let tiles_y = r.out_h / RESIZE_TILE;
    let tiles_x = r.out_w / RESIZE_TILE;
    let tiles_per_plane = tiles_y * tiles_x;

    for [tile, row, _] in l.grid() {
        if tile >= r.planes * tiles_per_plane || row >= RESIZE_TILE {
            continue;
        }
        let plane = tile / tiles_per_plane;
        let t = tile % tiles_per_plane;
        let oy = (t / tiles_x) * RESIZE_TILE + row;
        let x0 = (t % tiles_x) * RESIZE_TILE;
        for ox in x0..x0 + RESIZE_TILE {
            let value = r.sample(l, &input, plane, oy, ox)?;
            l.set(&mut output, (plane * r.out_h + oy) * r.out_w + ox, value)?;
        }
    }
    l.store(1, &output)
}
