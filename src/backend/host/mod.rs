//! Host compute backend
//!
//! Runs kernels on a single worker thread fed by a channel, which gives the
//! same asynchronous, in-order queue semantics as a device queue. Programs
//! come from a table keyed by kernel stem and instantiated per element type.

mod kernels;
mod launch;
mod memory;
mod table;

use std::any::Any;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::backend::{ComputeBackend, DeviceLimits, Launch, Program};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::kernel::{ArgKind, KernelName};
use crate::memory::BufferAllocator;
use crate::precision::Activation;

pub use launch::{ElementKind, HostLaunch, Variant};
pub use memory::{HostAllocator, HostMemory};
pub(crate) use table::{Family, HostKernelFn};

/// Largest work group the host queue accepts.
pub const HOST_MAX_WORK_GROUP_SIZE: u32 = 1024;

/// A host kernel bound to one element type and flag set.
pub struct HostProgram {
    name: String,
    signature: Vec<ArgKind>,
    variant: Variant,
    run: HostKernelFn,
}

impl std::fmt::Debug for HostProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProgram")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

impl Program for HostProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> &[ArgKind] {
        &self.signature
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

enum Job {
    Run(Launch),
    Fence(Sender<()>),
}

type ErrorSlot = Arc<Mutex<Option<RuntimeError>>>;

pub struct HostBackend {
    limits: DeviceLimits,
    allocator: Arc<HostAllocator>,
    table: HashMap<String, Family>,
    queue: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    first_error: ErrorSlot,
}

impl HostBackend {
    pub fn new(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let (tx, rx) = mpsc::channel();
        let first_error: ErrorSlot = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&first_error);
        let worker = std::thread::Builder::new()
            .name("host-queue".to_string())
            .spawn(move || worker_loop(rx, slot))
            .map_err(|e| RuntimeError::Config(format!("failed to start host queue: {}", e)))?;

        let table = table::build();
        log::info!(
            "HostBackend initialized ({} kernel families, vendor={}, compute_units={})",
            table.len(),
            config.vendor,
            config.compute_units
        );

        Ok(Self {
            limits: DeviceLimits {
                max_work_group_size: HOST_MAX_WORK_GROUP_SIZE,
                compute_units: config.compute_units,
                vendor: config.vendor,
            },
            allocator: Arc::new(HostAllocator::new()),
            table,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            first_error,
        })
    }

    fn send(&self, job: Job) -> Result<(), String> {
        let queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        match queue.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| "host queue worker has stopped".to_string()),
            None => Err("host queue is shut down".to_string()),
        }
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn allocator(&self) -> Arc<dyn BufferAllocator> {
        Arc::clone(&self.allocator) as Arc<dyn BufferAllocator>
    }

    fn compile(&self, name: &str) -> Result<Arc<dyn Program>, RuntimeError> {
        let (kernel_name, precision) = KernelName::parse(name)?;
        let stem = kernel_name.stem();
        let family = self
            .table
            .get(&stem)
            .ok_or_else(|| RuntimeError::resolution(name, format!("no kernel named '{}'", stem)))?;

        let variant = Variant {
            name: kernel_name,
            precision,
        };
        if variant.activation() != Activation::None {
            if !family.activation {
                return Err(RuntimeError::resolution(name, "kernel has no fused activation"));
            }
            if variant.quantized() {
                return Err(RuntimeError::resolution(
                    name,
                    "fused activation requires a float variant",
                ));
            }
        }
        if variant.merge_add() && !family.merge_add {
            return Err(RuntimeError::resolution(name, "kernel has no merge-add epilogue"));
        }

        let run = family.kernels.get(variant.element()).ok_or_else(|| {
            RuntimeError::resolution(name, format!("no {:?} instantiation", variant.element()))
        })?;
        let signature = family.signature.resolve(variant.quantized()).to_vec();

        Ok(Arc::new(HostProgram {
            name: name.to_string(),
            signature,
            variant,
            run,
        }))
    }

    fn kernel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .table
            .iter()
            .flat_map(|(stem, family)| family.kernels.names(stem))
            .collect();
        names.sort();
        names
    }

    fn submit(&self, launch: Launch) -> Result<(), RuntimeError> {
        if launch.program.as_any().downcast_ref::<HostProgram>().is_none() {
            return Err(RuntimeError::enqueue(
                launch.program.name(),
                "program was not built by the host backend",
            ));
        }
        let kernel = launch.program.name().to_string();
        log::trace!("Host submit: {} {}", kernel, launch.work);
        self.send(Job::Run(launch))
            .map_err(|reason| RuntimeError::enqueue(kernel, reason))
    }

    fn finish(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = mpsc::channel();
        self.send(Job::Fence(tx))
            .map_err(|reason| RuntimeError::enqueue("<fence>", reason))?;
        rx.recv()
            .map_err(|_| RuntimeError::enqueue("<fence>", "host queue worker has stopped"))?;

        let mut slot = self.first_error.lock().unwrap_or_else(|p| p.into_inner());
        match slot.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).take();
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                log::warn!("Host queue worker panicked");
            }
        }
    }
}

fn worker_loop(rx: Receiver<Job>, first_error: ErrorSlot) {
    for job in rx {
        match job {
            Job::Run(launch) => {
                if let Err(e) = run_launch(&launch) {
                    log::error!("{}", e);
                    let mut slot = first_error.lock().unwrap_or_else(|p| p.into_inner());
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
            }
            Job::Fence(done) => {
                let _ = done.send(());
            }
        }
    }
    log::debug!("Host queue worker exiting");
}

fn run_launch(launch: &Launch) -> Result<(), RuntimeError> {
    let program = launch
        .program
        .as_any()
        .downcast_ref::<HostProgram>()
        .ok_or_else(|| RuntimeError::kernel(launch.program.name(), "not a host program"))?;
    let ctx = HostLaunch::new(&program.name, &launch.args, &launch.work);
    (program.run)(&ctx, &program.variant)
}
