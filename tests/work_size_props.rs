use gpu_op_runtime::worksize::{
    align_to, biggest_divider, div_round_up, find_max_factor, powervr_work_size,
    vectorized_extent, BlockSize,
};
use proptest::prelude::*;

proptest! {
    #[test]
    fn test_max_factor_is_the_largest_divisor_under_cap(
        parent in 1u32..5000,
        cap in 1u32..1024,
    ) {
        let factor = find_max_factor(parent, cap);
        prop_assert!(factor >= 1);
        prop_assert!(factor <= cap);
        prop_assert_eq!(parent % factor, 0);
        prop_assert_eq!(factor, biggest_divider(parent, cap));
    }

    #[test]
    fn test_align_to_is_the_next_multiple(value in 0u32..1_000_000, align in 1u32..1024) {
        let aligned = align_to(value, align);
        prop_assert_eq!(aligned % align, 0);
        prop_assert!(aligned >= value);
        prop_assert!(aligned - value < align);
    }

    #[test]
    fn test_vectorized_extent_covers_every_element(extent in 0u32..1_000_000, vector in 1u32..32) {
        let items = vectorized_extent(extent, vector);
        prop_assert!(items as u64 * vector as u64 >= extent as u64);
        prop_assert!(items == 0 || (items as u64 - 1) * (vector as u64) < extent as u64);
        prop_assert_eq!(items, div_round_up(extent, vector));
    }

    #[test]
    fn test_one_d_launch_fits_the_cap(extent in 1u32..100_000, cap in 1u32..1024) {
        let local = find_max_factor(extent, cap);
        let global = align_to(extent, local);
        prop_assert_eq!(global, extent);
        prop_assert!(local <= cap);
    }

    #[test]
    fn test_powervr_grid_is_valid(
        width_batch in 1u32..512,
        height in 1u32..256,
        slices in 1u32..64,
        bx in 1u32..3,
        by in 1u32..3,
        bz in 1u32..3,
        cap in 1u32..1024,
    ) {
        let block = BlockSize::new(bx, by, bz);
        let work = powervr_work_size(width_batch, height, slices, block, cap);
        let global = work.global3();
        let local = work.local3();

        prop_assert!(global[0] * bx >= width_batch);
        prop_assert!(global[1] * by >= height);
        prop_assert!(global[2] * bz >= slices);
        for axis in 0..3 {
            prop_assert!(local[axis] >= 1);
            prop_assert_eq!(global[axis] % local[axis], 0);
        }
        prop_assert!(local[0] * local[1] * local[2] <= cap);
    }
}

#[test]
fn test_block_token_names_the_block() {
    assert_eq!(BlockSize::new(1, 1, 1).token(), "_block111");
    assert_eq!(BlockSize::new(2, 2, 1).token(), "_block221");
}
