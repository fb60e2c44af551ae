//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use gpu_op_runtime::{DataType, Runtime, TensorDesc, TensorRef};

pub fn host() -> Arc<Runtime> {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::host().expect("host runtime")
}

pub fn f32_tensor(rt: &Runtime, dims: &[u32], values: &[f32]) -> TensorRef {
    let t = rt
        .create_tensor(TensorDesc::new(dims, DataType::Float32))
        .expect("allocate f32 tensor");
    t.write(values).expect("write f32 tensor");
    t
}

pub fn i32_tensor(rt: &Runtime, dims: &[u32], values: &[i32]) -> TensorRef {
    let t = rt
        .create_tensor(TensorDesc::new(dims, DataType::Int32))
        .expect("allocate i32 tensor");
    t.write(values).expect("write i32 tensor");
    t
}

/// Placeholder output for operators that size their own output.
pub fn scratch(rt: &Runtime, data_type: DataType) -> TensorRef {
    rt.create_tensor(TensorDesc::new(&[1], data_type))
        .expect("allocate scratch tensor")
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {}: {} vs {} (tolerance {})",
            i,
            a,
            e,
            tolerance
        );
    }
}
