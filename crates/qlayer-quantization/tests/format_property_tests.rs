//! Property tests for the built-in compression formats.
//!
//! 1. **Reconstruction bound** – every dequantized element is within half a
//!    quantization step of the original, for all strategies and bit widths.
//! 2. **Pack / unpack** – packing in-range codes and unpacking recovers them.
//! 3. **Descriptor agreement** – `compress` produces exactly the parameters
//!    `describe_parameters` announces.

#![cfg(feature = "cpu")]

use candle_core::{Device, Tensor};
use proptest::prelude::*;
use qlayer_common::{QuantizationArgs, QuantizationStrategy};
use qlayer_quantization::observer::qparam_descriptors;
use qlayer_quantization::utils::{pack_codes, unpack_codes};
use qlayer_quantization::{
    CompressedWeightView, CompressionFormat, FormatRegistry, INT_QUANTIZED, PACK_QUANTIZED,
    WEIGHT_SCALE, compress_weight,
};

fn strategy_args() -> impl Strategy<Value = (QuantizationArgs, usize, usize)> {
    (
        prop::sample::select(vec![2u8, 4, 8]),
        any::<bool>(),
        0usize..3,
        1usize..5,
        prop::sample::select(vec![1usize, 2, 4, 8]),
        1usize..4,
    )
        .prop_map(|(bits, symmetric, strategy, rows, group, groups)| {
            let cols = group * groups;
            let args = match strategy {
                0 => QuantizationArgs::int8_channel().with_strategy(QuantizationStrategy::Tensor),
                1 => QuantizationArgs::int8_channel(),
                _ => QuantizationArgs::int4_group(group, symmetric),
            };
            (args.with_num_bits(bits).with_symmetric(symmetric), rows, cols)
        })
}

fn weight_case() -> impl Strategy<Value = (QuantizationArgs, Vec<usize>, Vec<f32>)> {
    strategy_args().prop_flat_map(|(args, rows, cols)| {
        prop::collection::vec(-8.0f32..8.0, rows * cols)
            .prop_map(move |values| (args.clone(), vec![rows, cols], values))
    })
}

fn scale_for(args: &QuantizationArgs, scales: &[f32], row: usize, col: usize, cols: usize) -> f32 {
    let gpr = args.groups_per_row(cols).unwrap();
    scales[args.qparam_index(row, col, gpr)]
}

fn check_format_bound(format_id: &str, args: &QuantizationArgs, shape: &[usize], values: &[f32]) {
    let registry = FormatRegistry::default();
    let format = registry.resolve(format_id).unwrap();
    let weight = Tensor::from_vec(values.to_vec(), shape, &Device::Cpu).unwrap();
    let store = compress_weight(format.as_ref(), &weight, args).unwrap();
    let view = CompressedWeightView { params: &store, args, weight_shape: shape, device: &Device::Cpu };
    let restored = format.decompress(&view).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let scales = store.require(WEIGHT_SCALE).unwrap().to_f32_vec().unwrap();

    let cols = shape[1];
    for (i, (&w, &r)) in values.iter().zip(&restored).enumerate() {
        let scale = scale_for(args, &scales, i / cols, i % cols, cols);
        let bound = scale * 0.5 * (1.0 + 1e-4) + 1e-6;
        assert!(
            (w - r).abs() <= bound,
            "{format_id} {args:?}: element {i} {w} -> {r} exceeds {bound}"
        );
    }
}

proptest! {
    #[test]
    fn prop_int_quantized_reconstruction_bound((args, shape, values) in weight_case()) {
        check_format_bound(INT_QUANTIZED, &args, &shape, &values);
    }

    #[test]
    fn prop_pack_quantized_reconstruction_bound((args, shape, values) in weight_case()) {
        check_format_bound(PACK_QUANTIZED, &args, &shape, &values);
    }
}

fn code_case() -> impl Strategy<Value = (u8, usize, usize, Vec<i8>)> {
    (prop::sample::select(vec![1u8, 2, 4, 8]), 1usize..4, 1usize..40).prop_flat_map(
        |(bits, rows, cols)| {
            let lo = -(1i16 << (bits - 1));
            let hi = (1i16 << (bits - 1)) - 1;
            prop::collection::vec((lo..=hi).prop_map(|c| c as i8), rows * cols)
                .prop_map(move |codes| (bits, rows, cols, codes))
        },
    )
}

proptest! {
    /// Packing codes in `[-2^(b-1), 2^(b-1) - 1]` and unpacking is lossless,
    /// including rows whose last word is only partly filled.
    #[test]
    fn prop_pack_unpack_recovers_codes((bits, rows, cols, codes) in code_case()) {
        let packed = pack_codes(&codes, rows, cols, bits).unwrap();
        prop_assert_eq!(packed.len(), rows * cols.div_ceil(32 / bits as usize));
        let unpacked = unpack_codes(&packed, rows, cols, bits).unwrap();
        prop_assert_eq!(unpacked, codes);
    }

    #[test]
    fn prop_compress_matches_descriptors((args, shape, values) in weight_case()) {
        let registry = FormatRegistry::default();
        for id in [INT_QUANTIZED, PACK_QUANTIZED] {
            let format = registry.resolve(id).unwrap();
            let weight = Tensor::from_vec(values.clone(), shape.as_slice(), &Device::Cpu).unwrap();
            let store = compress_weight(format.as_ref(), &weight, &args).unwrap();

            let mut expected = format.describe_parameters(&shape, &args).unwrap();
            expected.extend(qparam_descriptors(&shape, &args, false).unwrap());
            prop_assert_eq!(store.descriptors(), expected);
        }
    }
}
