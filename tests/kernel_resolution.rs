mod common;

use std::sync::Arc;
use std::thread;

use gpu_op_runtime::ops::{Gather, GatherParams, Operator};
use gpu_op_runtime::precision::Activation;
use gpu_op_runtime::{DataType, KernelName, PrecisionType, RuntimeError};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use common::{f32_tensor, host, i32_tensor, scratch};

const BASES: [&str; 6] = [
    "gather",
    "conv11",
    "gemmBlocked",
    "maxpooling",
    "fc_direct_opt",
    "depth_to_space",
];

fn activations() -> impl Strategy<Value = Activation> {
    prop::sample::select(vec![Activation::None, Activation::Relu, Activation::Relu6])
}

fn precisions() -> impl Strategy<Value = PrecisionType> {
    prop::sample::select(PrecisionType::ALL.to_vec())
}

proptest! {
    #[test]
    fn test_composition_is_deterministic_and_ordered(
        base in prop::sample::select(BASES.to_vec()),
        activation in activations(),
        merge_add in any::<bool>(),
        int32_input in any::<bool>(),
        precision in precisions(),
    ) {
        let build = || {
            KernelName::new(base)
                .signed(precision == PrecisionType::Int8)
                .activation(activation)
                .merge_add(merge_add)
                .int32_input(int32_input)
        };
        let full = build().with_precision(precision);
        prop_assert_eq!(&full, &build().with_precision(precision));
        prop_assert!(full.ends_with(precision.suffix()));

        let mut expected = String::new();
        if precision == PrecisionType::Int8 {
            expected.push_str("SIGNED");
        }
        expected.push_str(match activation {
            Activation::None => "",
            Activation::Relu => "RELU",
            Activation::Relu6 => "RELU6",
        });
        if merge_add {
            expected.push_str("MERGEADD");
        }
        if int32_input {
            expected.push_str("INT32");
        }
        expected.push_str(base);
        expected.push_str(precision.suffix());
        prop_assert_eq!(&full, &expected);

        let (parsed, parsed_precision) = KernelName::parse(&full).unwrap();
        prop_assert_eq!(parsed, build());
        prop_assert_eq!(parsed_precision, precision);
    }

    #[test]
    fn test_signed_prefix_needs_int8_suffix(
        base in prop::sample::select(BASES.to_vec()),
        precision in prop::sample::select(vec![PrecisionType::Fp32, PrecisionType::Fp16]),
    ) {
        let full = KernelName::new(base).signed(true).with_precision(precision);
        let is_resolution = matches!(KernelName::parse(&full), Err(RuntimeError::Resolution { .. }));
        prop_assert!(is_resolution);
    }
}

#[test]
fn test_both_8bit_tags_share_the_suffix() {
    let unsigned = KernelName::new("pad").with_precision(PrecisionType::UInt8);
    let signed = KernelName::new("pad")
        .signed(true)
        .with_precision(PrecisionType::Int8);
    assert_eq!(unsigned, "pad_INT8");
    assert_eq!(signed, "SIGNEDpad_INT8");
}

#[test]
fn test_every_listed_host_kernel_resolves() {
    let rt = host();
    let names = rt.kernel_names();
    assert!(!names.is_empty());
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);

    for full in &names {
        let (name, precision) = KernelName::parse(full).unwrap();
        assert_eq!(&name.with_precision(precision), full);
        let handle = rt.set_kernel(&name, precision).unwrap();
        assert_eq!(handle.name(), full.as_str());
    }
    assert_eq!(rt.registry().cache_size(), names.len());
}

#[test]
fn test_unsupported_combinations_fail_resolution() {
    let rt = host();
    let cases = [
        (KernelName::new("no_such_kernel"), PrecisionType::Fp32),
        (KernelName::new("gather").activation(Activation::Relu), PrecisionType::Fp32),
        (KernelName::new("gather").merge_add(true), PrecisionType::Fp32),
        (
            KernelName::new("conv11").activation(Activation::Relu),
            PrecisionType::UInt8,
        ),
    ];
    let count = cases.len() as u64;
    for (name, precision) in cases {
        let err = rt.set_kernel(&name, precision).unwrap_err();
        assert!(
            matches!(err, RuntimeError::Resolution { .. }),
            "{} resolved unexpectedly",
            name.with_precision(precision)
        );
    }
    assert_eq!(rt.registry().cache_size(), 0);
    assert_eq!(rt.registry().stats().unwrap().failures, count);
}

#[test]
fn test_concurrent_initializers_compile_once() {
    let rt = host();
    let workers: Vec<_> = (0..8)
        .map(|i| {
            let rt = Arc::clone(&rt);
            thread::spawn(move || -> Result<Vec<f32>, RuntimeError> {
                let input = f32_tensor(&rt, &[4], &[0.0, 1.0, 2.0, 3.0]);
                let indices = i32_tensor(&rt, &[1], &[i % 4]);
                let output = scratch(&rt, DataType::Float32);
                let mut op = Gather::new(Arc::clone(&rt), PrecisionType::Fp32);
                let params = GatherParams {
                    axis: 0,
                    android_nn: true,
                };
                op.initialize(&[input, indices], &[Arc::clone(&output)], &params)?;
                op.execute()?;
                rt.finish()?;
                op.release()?;
                output.read::<f32>()
            })
        })
        .collect();

    for (i, worker) in workers.into_iter().enumerate() {
        let values = worker.join().unwrap().unwrap();
        assert_eq!(values, vec![(i % 4) as f32]);
    }
    let stats = rt.registry().stats().unwrap();
    assert_eq!(stats.compiled, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 7);
}
