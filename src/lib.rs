//! GPU operator runtime
//!
//! Operator dispatch and execution core for neural-network inference.
//! Each operator binds tensors, validates shapes, picks a kernel variant by
//! name (precision, signedness, fused activation, hardware path) and
//! enqueues launches with derived geometry on an in-order queue.
//!
//! ```no_run
//! use std::sync::Arc;
//! use gpu_op_runtime::ops::{Gather, GatherParams, Operator};
//! use gpu_op_runtime::{DataType, PrecisionType, Runtime, TensorDesc};
//!
//! # fn main() -> Result<(), gpu_op_runtime::RuntimeError> {
//! let rt = Runtime::host()?;
//! let input = rt.create_tensor(TensorDesc::new(&[2, 3], DataType::Float32))?;
//! input.write(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0])?;
//! let indices = rt.create_tensor(TensorDesc::new(&[2], DataType::Int32))?;
//! indices.write(&[2i32, 0])?;
//! let output = rt.create_tensor(TensorDesc::new(&[2, 2], DataType::Float32))?;
//!
//! let mut gather = Gather::new(Arc::clone(&rt), PrecisionType::Fp32);
//! gather.initialize(&[input, indices], &[Arc::clone(&output)], &GatherParams { axis: 1, android_nn: false })?;
//! gather.execute()?;
//! rt.finish()?;
//! assert_eq!(output.read::<f32>()?, vec![3.0, 1.0, 6.0, 4.0]);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod element;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod ops;
pub mod precision;
pub mod runtime;
pub mod sync;
pub mod tensor;
pub mod worksize;

pub use backend::{ComputeBackend, DeviceLimits, Vendor};
pub use config::{BackendKind, RuntimeConfig};
pub use error::{RuntimeError, Status, VulkanErrorKind};
pub use kernel::{KernelArgs, KernelName, KernelRegistry};
pub use ops::{AnyOperator, Lifecycle, OpParameters, Operator, OperatorKind};
pub use precision::{Activation, PrecisionType};
pub use runtime::Runtime;
pub use tensor::{DataType, QuantParams, StorageType, Tensor, TensorDesc, TensorRef};
pub use worksize::WorkSize;
