//! Operator runtime probe
//!
//! Usage:
//!   gpu_op_probe [--config FILE] list-kernels
//!   gpu_op_probe [--config FILE] demo
//!   gpu_op_probe work-size --extent 1000 --vector 8 --cap 128
//!
//! `RUST_LOG=debug` shows kernel resolution and launches.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use gpu_op_runtime::ops::{Gather, GatherParams, Operator};
use gpu_op_runtime::worksize::{align_to, find_max_factor, vectorized_extent};
use gpu_op_runtime::{DataType, PrecisionType, Runtime, RuntimeConfig, RuntimeError, TensorDesc};

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect the GPU operator runtime")]
struct Cli {
    /// JSON runtime configuration; GPU_OP_* variables override it.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every kernel name the backend can compile.
    ListKernels,
    /// Gather columns [2, 0] of a 2x3 matrix and print the result.
    Demo,
    /// Print the 1-D launch geometry derived for an extent.
    WorkSize {
        #[arg(long)]
        extent: u32,
        /// Elements handled per work item.
        #[arg(long, default_value_t = 1)]
        vector: u32,
        /// Work-group cap.
        #[arg(long, default_value_t = 128)]
        cap: u32,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig, RuntimeError> {
    let config = match path {
        Some(p) => RuntimeConfig::from_file(p)?,
        None => RuntimeConfig::default(),
    };
    config.with_env_overrides()
}

fn list_kernels(rt: &Runtime) {
    let names = rt.kernel_names();
    println!("{} kernels on the {} backend:", names.len(), rt.backend_name());
    for name in names {
        println!("  {}", name);
    }
}

fn demo(rt: &Arc<Runtime>) -> Result<(), RuntimeError> {
    let input = rt.create_tensor(TensorDesc::new(&[2, 3], DataType::Float32))?;
    input.write(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0])?;
    let indices = rt.create_tensor(TensorDesc::new(&[2], DataType::Int32))?;
    indices.write(&[2i32, 0])?;
    let output = rt.create_tensor(TensorDesc::new(&[1], DataType::Float32))?;

    let mut gather = Gather::new(Arc::clone(rt), PrecisionType::Fp32);
    let params = GatherParams {
        axis: 1,
        android_nn: true,
    };
    gather.initialize(&[input, indices], &[Arc::clone(&output)], &params)?;
    gather.execute()?;
    rt.finish()?;

    println!("kernel: {}", gather.kernel_names().join(", "));
    println!("output {:?}: {:?}", output.dims(), output.read::<f32>()?);
    gather.release()
}

fn work_size(extent: u32, vector: u32, cap: u32) {
    let items = vectorized_extent(extent, vector.max(1));
    let local = find_max_factor(items, cap);
    println!("extent={} vector={} cap={}", extent, vector, cap);
    println!("  work items: {}", items);
    println!("  local:      {}", local);
    println!("  global:     {}", align_to(items, local));
}

fn run(cli: Cli) -> Result<(), RuntimeError> {
    if let Command::WorkSize { extent, vector, cap } = cli.command {
        work_size(extent, vector, cap);
        return Ok(());
    }
    let rt = Runtime::new(load_config(cli.config.as_ref())?)?;
    match cli.command {
        Command::ListKernels => list_kernels(&rt),
        Command::Demo => demo(&rt)?,
        Command::WorkSize { .. } => {}
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
