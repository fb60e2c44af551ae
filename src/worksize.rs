//! Work-size derivation
//!
//! Pure helpers that turn tensor extents into launch geometry. Every
//! operator goes through these so the grid always covers the extent.

use std::fmt;

/// Global grid and optional work-group shape of one launch (1 to 3 dims).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSize {
    dims: usize,
    global: [u32; 3],
    local: Option<[u32; 3]>,
}

impl WorkSize {
    pub fn one_d(global: u32, local: Option<u32>) -> Self {
        Self {
            dims: 1,
            global: [global, 1, 1],
            local: local.map(|l| [l, 1, 1]),
        }
    }

    pub fn two_d(global: [u32; 2], local: Option<[u32; 2]>) -> Self {
        Self {
            dims: 2,
            global: [global[0], global[1], 1],
            local: local.map(|l| [l[0], l[1], 1]),
        }
    }

    pub fn three_d(global: [u32; 3], local: Option<[u32; 3]>) -> Self {
        Self {
            dims: 3,
            global,
            local,
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn global(&self) -> &[u32] {
        &self.global[..self.dims]
    }

    pub fn local(&self) -> Option<&[u32]> {
        self.local.as_ref().map(|l| &l[..self.dims])
    }

    /// Global extents padded to three axes with 1s.
    pub fn global3(&self) -> [u32; 3] {
        self.global
    }

    /// Work-group shape padded to three axes; `[1, 1, 1]` when unspecified.
    pub fn local3(&self) -> [u32; 3] {
        self.local.unwrap_or([1, 1, 1])
    }

    pub fn total_items(&self) -> u64 {
        self.global().iter().map(|&g| g as u64).product()
    }

    pub fn group_items(&self) -> u64 {
        self.local()
            .map(|l| l.iter().map(|&v| v as u64).product())
            .unwrap_or(1)
    }
}

impl fmt::Display for WorkSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "global={:?}", self.global())?;
        match self.local() {
            Some(l) => write!(f, " local={:?}", l),
            None => write!(f, " local=auto"),
        }
    }
}

/// Largest divisor of `parent` that does not exceed `threshold`.
///
/// Odd parents only have odd divisors, so the search steps by 2 from an odd
/// start. Returns 1 when no better divisor exists.
pub fn find_max_factor(parent: u32, threshold: u32) -> u32 {
    if parent <= 1 || threshold <= 1 {
        return 1;
    }
    let step = 1 + (parent & 1);
    let threshold = if step == 2 {
        ((threshold - 1) >> 1 << 1) + 1
    } else {
        threshold
    };
    let mut i = threshold.min(parent);
    while i > 0 {
        if parent % i == 0 {
            return i;
        }
        i = i.saturating_sub(step);
    }
    1
}

/// Round `value` up to a multiple of `align`.
#[inline]
pub fn align_to(value: u32, align: u32) -> u32 {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}

/// `ceil(value / divisor)`.
#[inline]
pub fn div_round_up(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor.max(1))
}

/// Global extent for a kernel that handles `vector` elements per work item.
/// Rounds up so the kernel's bound check can drop the excess items.
#[inline]
pub fn vectorized_extent(extent: u32, vector: u32) -> u32 {
    div_round_up(extent, vector)
}

/// Largest divisor of `value` not exceeding `limit`, searched exhaustively.
pub fn biggest_divider(value: u32, limit: u32) -> u32 {
    (1..=limit.min(value).max(1))
        .rev()
        .find(|d| value % d == 0)
        .unwrap_or(1)
}

// Elements per work item baked into kernel bodies. Operators derive
// their grids from the same constants.

/// Float elementwise kernels (tanh, scale).
pub const VECTOR_WIDTH: u32 = 8;
/// Input columns per item of `depth_to_space_opt_vload`.
pub const DEPTH_TO_SPACE_VECTOR: u32 = 8;
/// Output channels per item of `gemmBlocked`.
pub const GEMM_CHANNEL_BLOCK: u32 = 4;
/// Output columns per item of `dilation_conv_k3d8p8_4x8`.
pub const DILATED_COLUMN_BLOCK: u32 = 8;
/// Outputs per item of the 8x1 fully-connected kernels.
pub const FC_BLOCK: u32 = 8;
/// Output tile edge of `resize_bilinear_32_to_512`.
pub const RESIZE_TILE: u32 = 16;

/// Per-work-item output block of a tiled kernel variant.
///
/// The same value produces the kernel-name token and the grid, so the two
/// cannot drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl BlockSize {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Name token, e.g. `_block212`.
    pub fn token(&self) -> String {
        format!("_block{}{}{}", self.x, self.y, self.z)
    }
}

/// Geometry of the PowerVR blocked convolution.
///
/// `width_batch` is `out_w * batch`; `slices` is `ceil(out_c / 4)`.
pub fn powervr_work_size(
    width_batch: u32,
    height: u32,
    slices: u32,
    block: BlockSize,
    cap: u32,
) -> WorkSize {
    let grid = [
        div_round_up(width_batch, block.x),
        div_round_up(height, block.y),
        div_round_up(slices, block.z),
    ];
    let wg = powervr_work_group(grid, cap);
    WorkSize::three_d(
        [
            align_to(grid[0], wg[0]),
            align_to(grid[1], wg[1]),
            align_to(grid[2], wg[2]),
        ],
        Some(wg),
    )
}

fn powervr_work_group(grid: [u32; 3], cap: u32) -> [u32; 3] {
    let z_limit = if grid[0] > 48 { 8 } else { 4 };
    let wg_z = biggest_divider(grid[2], z_limit).min(cap.max(1));
    let wg_xy = (cap / wg_z).max(1);
    let wg_x = grid[0].min(wg_xy).max(1);
    let mut wg_y = (wg_xy / wg_x).min(grid[1]).max(1);
    if wg_y == grid[1] && grid[1] % 2 == 0 {
        wg_y /= 2;
    }
    [wg_x, wg_y.max(1), wg_z]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_max_factor() {
        assert_eq!(find_max_factor(1, 128), 1);
        assert_eq!(find_max_factor(100, 1), 1);
        assert_eq!(find_max_factor(256, 128), 128);
        assert_eq!(find_max_factor(100, 128), 100);
        assert_eq!(find_max_factor(300, 128), 100);
        assert_eq!(find_max_factor(45, 128), 45);
        assert_eq!(find_max_factor(225, 128), 75);
        assert_eq!(find_max_factor(131, 128), 1);
        assert_eq!(find_max_factor(2, 128), 2);
    }

    #[test]
    fn test_align_and_round_up() {
        assert_eq!(align_to(33, 32), 64);
        assert_eq!(align_to(64, 32), 64);
        assert_eq!(align_to(0, 32), 0);
        assert_eq!(div_round_up(17, 8), 3);
        assert_eq!(vectorized_extent(16, 8), 2);
        assert_eq!(vectorized_extent(0, 8), 0);
    }

    #[test]
    fn test_work_size_views() {
        let ws = WorkSize::two_d([4, 6], Some([1, 3]));
        assert_eq!(ws.dims(), 2);
        assert_eq!(ws.global(), &[4, 6]);
        assert_eq!(ws.local(), Some(&[1u32, 3][..]));
        assert_eq!(ws.total_items(), 24);
        assert_eq!(ws.group_items(), 3);
        assert_eq!(ws.to_string(), "global=[4, 6] local=[1, 3]");
    }

    #[test]
    fn test_powervr_grid_uses_block() {
        let block = BlockSize::new(2, 1, 2);
        let ws = powervr_work_size(64, 16, 8, block, 128);
        let [gx, gy, gz] = ws.global3();
        let [lx, ly, lz] = ws.local3();
        assert!(gx * block.x >= 64);
        assert!(gy * block.y >= 16);
        assert!(gz * block.z >= 8);
        assert_eq!(gx % lx, 0);
        assert_eq!(gy % ly, 0);
        assert_eq!(gz % lz, 0);
        assert!(lx * ly * lz <= 128);
        assert_eq!(block.token(), "_block212");
    }
}
