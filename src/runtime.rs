//! Runtime facade
//!
//! Owns the backend, its in-order queue and the shared kernel registry.
//! Operators hold an `Arc<Runtime>` and go through it for every kernel
//! lookup and launch.

use std::sync::Arc;

use crate::backend::host::HostBackend;
use crate::backend::vulkan::VulkanBackend;
use crate::backend::{ComputeBackend, Launch, Vendor};
use crate::config::{BackendKind, RuntimeConfig};
use crate::error::{RuntimeError, Status};
use crate::kernel::{KernelArgs, KernelHandle, KernelName, KernelRegistry};
use crate::memory::BufferAllocator;
use crate::precision::PrecisionType;
use crate::tensor::{Tensor, TensorDesc, TensorRef};
use crate::worksize::WorkSize;

pub struct Runtime {
    config: RuntimeConfig,
    backend: Arc<dyn ComputeBackend>,
    registry: Arc<KernelRegistry>,
}

impl Runtime {
    /// Create the configured backend and warm the registry.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>, RuntimeError> {
        let backend: Arc<dyn ComputeBackend> = match config.backend {
            BackendKind::Host => Arc::new(HostBackend::new(&config)?),
            BackendKind::Vulkan => Arc::new(VulkanBackend::new(&config)?),
        };
        Self::with_backend(config, backend)
    }

    /// Host backend with default configuration.
    pub fn host() -> Result<Arc<Self>, RuntimeError> {
        Self::new(RuntimeConfig::default())
    }

    pub fn with_backend(
        config: RuntimeConfig,
        backend: Arc<dyn ComputeBackend>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let registry = Arc::new(KernelRegistry::new(Arc::clone(&backend)));
        if !config.precompile.is_empty() {
            registry.precompile(&config.precompile);
        }
        let limits = backend.limits();
        log::info!(
            "Runtime ready: backend={} vendor={} work_group_cap={} compute_units={}",
            backend.name(),
            limits.vendor,
            config.max_work_group_size.min(limits.max_work_group_size),
            limits.compute_units
        );
        Ok(Arc::new(Self {
            config,
            backend,
            registry,
        }))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn registry(&self) -> &Arc<KernelRegistry> {
        &self.registry
    }

    /// Every kernel name the backend can compile.
    pub fn kernel_names(&self) -> Vec<String> {
        self.backend.kernel_names()
    }

    pub fn allocator(&self) -> Arc<dyn BufferAllocator> {
        self.backend.allocator()
    }

    pub fn create_tensor(&self, desc: TensorDesc) -> Result<TensorRef, RuntimeError> {
        Tensor::allocate(self.allocator(), desc)
    }

    /// Work-group cap operators derive geometry against: the configured
    /// cap bounded by the device limit.
    pub fn work_group_cap(&self) -> u32 {
        self.config
            .max_work_group_size
            .min(self.backend.limits().max_work_group_size)
            .max(1)
    }

    pub fn vendor(&self) -> Vendor {
        self.backend.limits().vendor
    }

    pub fn compute_units(&self) -> u32 {
        self.backend.limits().compute_units.max(1)
    }

    /// Append the precision suffix to `name` and resolve it.
    pub fn set_kernel(
        &self,
        name: &KernelName,
        precision: PrecisionType,
    ) -> Result<KernelHandle, RuntimeError> {
        let full = name.with_precision(precision);
        let program = self.registry.get_or_compile(&full)?;
        log::debug!("Resolved kernel {}", full);
        Ok(KernelHandle::new(full, program))
    }

    /// Validate a launch against the program signature and the work-group
    /// cap, then queue it. Does not wait for completion.
    pub fn enqueue_kernel(
        &self,
        handle: &KernelHandle,
        args: KernelArgs,
        work: &WorkSize,
    ) -> Status {
        check_args(handle, &args)?;
        check_geometry(handle.name(), work, self.work_group_cap())?;
        log::trace!("Enqueue {} {}", handle.name(), work);
        self.backend.submit(Launch {
            program: Arc::clone(handle.program()),
            args: args.into_vec(),
            work: *work,
        })
    }

    /// Block until every queued launch has run.
    pub fn finish(&self) -> Status {
        self.backend.finish()
    }
}

fn check_args(handle: &KernelHandle, args: &KernelArgs) -> Status {
    let signature = handle.signature();
    if signature.len() != args.len() {
        return Err(RuntimeError::enqueue(
            handle.name(),
            format!("expected {} arguments, got {}", signature.len(), args.len()),
        ));
    }
    for (i, (expected, arg)) in signature.iter().zip(args.as_slice()).enumerate() {
        if *expected != arg.kind() {
            return Err(RuntimeError::enqueue(
                handle.name(),
                format!("argument {} is {:?}, expected {:?}", i, arg.kind(), expected),
            ));
        }
    }
    Ok(())
}

fn check_geometry(kernel: &str, work: &WorkSize, limit: u32) -> Status {
    let global = work.global();
    if global.is_empty() || global.iter().any(|&g| g == 0) {
        return Err(RuntimeError::enqueue(
            kernel,
            format!("empty global size {:?}", global),
        ));
    }
    if let Some(local) = work.local() {
        if local.len() != global.len() {
            return Err(RuntimeError::enqueue(
                kernel,
                format!("local rank {} != global rank {}", local.len(), global.len()),
            ));
        }
        if local.iter().any(|&l| l == 0) {
            return Err(RuntimeError::enqueue(kernel, "zero local size"));
        }
        let items: u64 = local.iter().map(|&l| l as u64).product();
        if items > limit as u64 {
            return Err(RuntimeError::enqueue(
                kernel,
                format!("work group of {} exceeds limit {}", items, limit),
            ));
        }
        if let Some(axis) = (0..global.len()).find(|&a| global[a] % local[a] != 0) {
            return Err(RuntimeError::enqueue(
                kernel,
                format!(
                    "global {} not a multiple of local {} on axis {}",
                    global[axis], local[axis], axis
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DataType;

    #[test]
    fn test_set_kernel_appends_suffix() {
        let rt = Runtime::host().unwrap();
        let handle = rt
            .set_kernel(&KernelName::new("gather"), PrecisionType::Fp16)
            .unwrap();
        assert_eq!(handle.name(), "gather_FP16");
        assert!(rt.registry().is_cached("gather_FP16"));
    }

    #[test]
    fn test_unknown_kernel_is_resolution_error() {
        let rt = Runtime::host().unwrap();
        let err = rt
            .set_kernel(&KernelName::new("no_such_op"), PrecisionType::Fp32)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Resolution { .. }));
    }

    #[test]
    fn test_enqueue_checks_signature() {
        let rt = Runtime::host().unwrap();
        let handle = rt
            .set_kernel(&KernelName::new("dilation_init"), PrecisionType::Fp32)
            .unwrap();
        let out = rt.create_tensor(TensorDesc::new(&[4], DataType::Float32)).unwrap();

        let short = KernelArgs::new().buffer(&out).u32(4);
        let err = rt
            .enqueue_kernel(&handle, short, &WorkSize::one_d(4, None))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Enqueue { .. }));

        let swapped = KernelArgs::new().buffer(&out).f32(4.0).f32(0.0);
        assert!(rt
            .enqueue_kernel(&handle, swapped, &WorkSize::one_d(4, None))
            .is_err());
    }

    #[test]
    fn test_enqueue_checks_geometry() {
        let rt = Runtime::host().unwrap();
        let handle = rt
            .set_kernel(&KernelName::new("dilation_init"), PrecisionType::Fp32)
            .unwrap();
        let out = rt.create_tensor(TensorDesc::new(&[4], DataType::Float32)).unwrap();
        let args = || KernelArgs::new().buffer(&out).u32(4).f32(1.0);

        assert!(rt.enqueue_kernel(&handle, args(), &WorkSize::one_d(0, None)).is_err());
        assert!(rt.enqueue_kernel(&handle, args(), &WorkSize::one_d(4, Some(0))).is_err());
        assert!(rt.enqueue_kernel(&handle, args(), &WorkSize::one_d(6, Some(4))).is_err());
        assert!(rt
            .enqueue_kernel(&handle, args(), &WorkSize::one_d(4096, Some(2048)))
            .is_err());

        rt.enqueue_kernel(&handle, args(), &WorkSize::one_d(4, Some(2))).unwrap();
        rt.finish().unwrap();
        assert_eq!(out.read::<f32>().unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn test_work_group_cap_is_bounded_by_config() {
        let config = RuntimeConfig {
            max_work_group_size: 64,
            ..RuntimeConfig::default()
        };
        let rt = Runtime::new(config).unwrap();
        assert_eq!(rt.work_group_cap(), 64);

        let config = RuntimeConfig {
            max_work_group_size: 100_000,
            ..RuntimeConfig::default()
        };
        let rt = Runtime::new(config).unwrap();
        assert_eq!(rt.work_group_cap(), crate::backend::host::HOST_MAX_WORK_GROUP_SIZE);
    }

    #[test]
    fn test_enqueue_rejects_groups_above_configured_cap() {
        let config = RuntimeConfig {
            max_work_group_size: 8,
            ..RuntimeConfig::default()
        };
        let rt = Runtime::new(config).unwrap();
        let handle = rt
            .set_kernel(&KernelName::new("dilation_init"), PrecisionType::Fp32)
            .unwrap();
        let out = rt.create_tensor(TensorDesc::new(&[16], DataType::Float32)).unwrap();
        let args = || KernelArgs::new().buffer(&out).u32(16).f32(2.0);

        let err = rt
            .enqueue_kernel(&handle, args(), &WorkSize::one_d(16, Some(16)))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Enqueue { .. }));
        rt.enqueue_kernel(&handle, args(), &WorkSize::one_d(16, Some(8))).unwrap();
        rt.finish().unwrap();
        assert_eq!(out.read::<f32>().unwrap(), vec![2.0; 16]);
    }
}
