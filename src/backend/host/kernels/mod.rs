//! Host kernel bodies, generic over the element type.
//!
//! Bodies walk the launch grid and bounds-check every work item against
//! the real extents, like their device counterparts.

/// Build an `ElementKernels` from one generic body.
macro_rules! instantiate {
    ($kernel:ident => $($field:ident: $ty:ty),+ $(,)?) => {
        $crate::backend::host::table::ElementKernels {
            $($field: Some($kernel::<$ty> as $crate::backend::host::table::HostKernelFn),)+
            ..Default::default()
        }
    };
}

pub(super) mod convolution;
pub(super) mod elementwise;
pub(super) mod linear;
pub(super) mod movement;
pub(super) mod pooling;
pub(super) mod recurrent;

#[inline]
pub(super) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
