//! Utility functions for quantization operations

use qlayer_common::{QLayerError, QuantizationArgs, QuantizationStrategy, Result, matrix_dims};
use candle_core::{DType, Device, Tensor};
use rayon::prelude::*;

/// Per-group scale and zero-point values, flattened in row-major group order.
#[derive(Debug, Clone, PartialEq)]
pub struct QParams {
    pub scales: Vec<f32>,
    /// `None` for symmetric schemes (implicit zero-point of 0).
    pub zero_points: Option<Vec<i8>>,
}

impl QParams {
    #[inline]
    pub fn zero_point(&self, idx: usize) -> i32 {
        self.zero_points.as_ref().map_or(0, |zp| zp[idx] as i32)
    }
}

/// Quantize a single value to an integer code in `[q_min, q_max]`.
#[inline]
pub fn quantize_value(value: f32, scale: f32, zero_point: i32, q_min: i32, q_max: i32) -> i32 {
    let q = (value / scale).round() as i32 + zero_point;
    q.clamp(q_min, q_max)
}

/// Dequantize a single integer code.
#[inline]
pub fn dequantize_value(code: i32, scale: f32, zero_point: i32) -> f32 {
    (code - zero_point) as f32 * scale
}

/// Min-max qparams for one group of values.
///
/// The observed range always includes zero. Scales are clamped to at least
/// `f32::EPSILON` so all-zero groups stay representable.
pub fn calculate_group_qparams(values: &[f32], args: &QuantizationArgs) -> (f32, i8) {
    let (q_min, q_max) = args.q_range();
    let (min_val, max_val) = values
        .iter()
        .fold((0.0f32, 0.0f32), |(lo, hi), &x| (lo.min(x), hi.max(x)));

    if args.symmetric {
        let abs_max = min_val.abs().max(max_val.abs());
        let scale = abs_max / ((q_max - q_min) as f32 / 2.0);
        (scale.max(f32::EPSILON), 0)
    } else {
        let scale = ((max_val - min_val) / (q_max - q_min) as f32).max(f32::EPSILON);
        let zero_point = (q_min as f32 - min_val / scale).round() as i32;
        (scale, zero_point.clamp(q_min, q_max) as i8)
    }
}

/// Min-max qparams for a row-major `(out, in)` weight under `args`.
pub fn calculate_qparams(data: &[f32], weight_shape: &[usize], args: &QuantizationArgs) -> Result<QParams> {
    args.validate()?;
    let (out_features, in_features) = matrix_dims(weight_shape)?;
    validate_len(data, out_features, in_features)?;
    let groups_per_row = args.groups_per_row(in_features)?;

    let pairs: Vec<(f32, i8)> = match args.strategy {
        QuantizationStrategy::Tensor => vec![calculate_group_qparams(data, args)],
        QuantizationStrategy::Channel => data
            .par_chunks(in_features.max(1))
            .map(|row| calculate_group_qparams(row, args))
            .collect(),
        QuantizationStrategy::Group => {
            let group_size = in_features / groups_per_row;
            data.par_chunks(group_size.max(1))
                .map(|group| calculate_group_qparams(group, args))
                .collect()
        }
    };

    let scales = pairs.iter().map(|&(s, _)| s).collect();
    let zero_points = args
        .uses_zero_point()
        .then(|| pairs.iter().map(|&(_, zp)| zp).collect());
    Ok(QParams { scales, zero_points })
}

/// Quantize a row-major `(out, in)` matrix into integer codes.
pub fn quantize_matrix(
    data: &[f32],
    weight_shape: &[usize],
    args: &QuantizationArgs,
    qparams: &QParams,
) -> Result<Vec<i8>> {
    args.validate()?;
    let (out_features, in_features) = matrix_dims(weight_shape)?;
    validate_len(data, out_features, in_features)?;
    let groups_per_row = args.groups_per_row(in_features)?;
    validate_qparams(qparams, out_features, groups_per_row, args)?;
    let (q_min, q_max) = args.q_range();

    let mut codes = vec![0i8; data.len()];
    if data.is_empty() {
        return Ok(codes);
    }
    codes
        .par_chunks_mut(in_features)
        .zip(data.par_chunks(in_features))
        .enumerate()
        .for_each(|(row, (code_row, weight_row))| {
            for (col, (&w, code)) in weight_row.iter().zip(code_row.iter_mut()).enumerate() {
                let idx = args.qparam_index(row, col, groups_per_row);
                let q = quantize_value(w, qparams.scales[idx], qparams.zero_point(idx), q_min, q_max);
                *code = q as i8;
            }
        });
    Ok(codes)
}

/// Dequantize integer codes of a row-major `(out, in)` matrix.
pub fn dequantize_matrix(
    codes: &[i8],
    weight_shape: &[usize],
    args: &QuantizationArgs,
    qparams: &QParams,
) -> Result<Vec<f32>> {
    args.validate()?;
    let (out_features, in_features) = matrix_dims(weight_shape)?;
    if codes.len() != out_features * in_features {
        return Err(QLayerError::decompression(format!(
            "expected {} codes for shape {weight_shape:?}, found {}",
            out_features * in_features,
            codes.len()
        )));
    }
    let groups_per_row = args.groups_per_row(in_features)?;
    validate_qparams(qparams, out_features, groups_per_row, args)?;

    let mut values = vec![0.0f32; codes.len()];
    if codes.is_empty() {
        return Ok(values);
    }
    values
        .par_chunks_mut(in_features)
        .zip(codes.par_chunks(in_features))
        .enumerate()
        .for_each(|(row, (value_row, code_row))| {
            for (col, (&q, value)) in code_row.iter().zip(value_row.iter_mut()).enumerate() {
                let idx = args.qparam_index(row, col, groups_per_row);
                *value = dequantize_value(q as i32, qparams.scales[idx], qparams.zero_point(idx));
            }
        });
    Ok(values)
}

/// Number of `bits`-wide codes held by one 32-bit word.
pub fn codes_per_word(bits: u8) -> Result<usize> {
    if bits == 0 || bits > 8 || 32 % bits as usize != 0 {
        return Err(QLayerError::config(format!(
            "cannot pack {bits}-bit codes into 32-bit words"
        )));
    }
    Ok(32 / bits as usize)
}

/// Pack signed codes row by row into 32-bit words, lowest bits first.
///
/// Codes are stored offset by `2^(bits-1)` so every stored field is unsigned.
pub fn pack_codes(codes: &[i8], rows: usize, cols: usize, bits: u8) -> Result<Vec<u32>> {
    let per_word = codes_per_word(bits)?;
    let words_per_row = cols.div_ceil(per_word);
    let offset = 1i32 << (bits - 1);
    let mask = (1u32 << bits) - 1;

    let mut packed = vec![0u32; rows * words_per_row];
    if codes.is_empty() || words_per_row == 0 {
        return Ok(packed);
    }
    packed
        .par_chunks_mut(words_per_row)
        .zip(codes.par_chunks(cols))
        .for_each(|(word_row, code_row)| {
            for (i, &code) in code_row.iter().enumerate() {
                let unsigned = ((code as i32 + offset) as u32) & mask;
                word_row[i / per_word] |= unsigned << ((i % per_word) * bits as usize);
            }
        });
    Ok(packed)
}

/// Inverse of [`pack_codes`].
pub fn unpack_codes(packed: &[u32], rows: usize, cols: usize, bits: u8) -> Result<Vec<i8>> {
    let per_word = codes_per_word(bits)?;
    let words_per_row = cols.div_ceil(per_word);
    if packed.len() != rows * words_per_row {
        return Err(QLayerError::decompression(format!(
            "expected {} packed words for {rows}x{cols} at {bits} bits, found {}",
            rows * words_per_row,
            packed.len()
        )));
    }
    let offset = 1i32 << (bits - 1);
    let mask = (1u32 << bits) - 1;

    let mut codes = vec![0i8; rows * cols];
    if codes.is_empty() {
        return Ok(codes);
    }
    codes
        .par_chunks_mut(cols)
        .zip(packed.par_chunks(words_per_row))
        .for_each(|(code_row, word_row)| {
            for (i, code) in code_row.iter_mut().enumerate() {
                let field = (word_row[i / per_word] >> ((i % per_word) * bits as usize)) & mask;
                *code = (field as i32 - offset) as i8;
            }
        });
    Ok(codes)
}

/// Mean squared error between two equally sized slices.
pub fn calculate_mse(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(QLayerError::ShapeMismatch { input: vec![a.len()], weight: vec![b.len()] });
    }
    if a.is_empty() {
        return Ok(0.0);
    }
    Ok(a.iter().zip(b).map(|(&x, &y)| (x - y).powi(2)).sum::<f32>() / a.len() as f32)
}

/// Flatten any float tensor into host `f32` values.
pub fn extract_f32_data(tensor: &Tensor) -> Result<Vec<f32>> {
    let t = if tensor.dtype() != DType::F32 { tensor.to_dtype(DType::F32)? } else { tensor.clone() };
    let t = if t.device().is_cpu() { t } else { t.to_device(&Device::Cpu)? };
    Ok(t.flatten_all()?.to_vec1::<f32>()?)
}

fn validate_len(data: &[f32], out_features: usize, in_features: usize) -> Result<()> {
    if data.len() != out_features * in_features {
        return Err(QLayerError::ShapeMismatch {
            input: vec![data.len()],
            weight: vec![out_features, in_features],
        });
    }
    Ok(())
}

fn validate_qparams(
    qparams: &QParams,
    out_features: usize,
    groups_per_row: usize,
    args: &QuantizationArgs,
) -> Result<()> {
    let expected = match args.strategy {
        QuantizationStrategy::Tensor => 1,
        _ => out_features * groups_per_row,
    };
    if qparams.scales.len() != expected {
        return Err(QLayerError::invalid_parameter(
            "weight_scale",
            format!("expected {expected} scales, found {}", qparams.scales.len()),
        ));
    }
    if let Some(zp) = &qparams.zero_points {
        if zp.len() != expected {
            return Err(QLayerError::invalid_parameter(
                "weight_zero_point",
                format!("expected {expected} zero points, found {}", zp.len()),
            ));
        }
    }
    Ok(())
}

#[cfg(all(test, feature = "cpu"))]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_4bit() {
        let codes: Vec<i8> = vec![-8, -1, 0, 1, 7, 3, -4, 2, 5, -6];
        let packed = pack_codes(&codes, 2, 5, 4).unwrap();
        // 5 codes per row fit in one word at 8 codes per word.
        assert_eq!(packed.len(), 2);
        assert_eq!(unpack_codes(&packed, 2, 5, 4).unwrap(), codes);
    }

    #[test]
    fn test_pack_layout_lowest_bits_first() {
        // offsets: -8 -> 0, 7 -> 15
        let packed = pack_codes(&[-8, 7], 1, 2, 4).unwrap();
        assert_eq!(packed, vec![0xF0]);
    }

    #[test]
    fn test_codes_per_word_rejects_odd_widths() {
        assert_eq!(codes_per_word(4).unwrap(), 8);
        assert_eq!(codes_per_word(8).unwrap(), 4);
        assert!(codes_per_word(3).is_err());
        assert!(codes_per_word(0).is_err());
    }

    #[test]
    fn test_symmetric_scale() {
        let args = QuantizationArgs::int8_channel();
        let (scale, zp) = calculate_group_qparams(&[1.0, -2.0, 0.5], &args);
        assert!((scale - 2.0 / 127.5).abs() < 1e-7);
        assert_eq!(zp, 0);
    }

    #[test]
    fn test_asymmetric_zero_point() {
        let args = QuantizationArgs::int8_channel().with_symmetric(false);
        let (scale, zp) = calculate_group_qparams(&[0.0, 2.55], &args);
        assert!((scale - 0.01).abs() < 1e-6);
        assert_eq!(zp, -128);
    }

    #[test]
    fn test_all_zero_group() {
        let args = QuantizationArgs::int8_channel();
        let (scale, zp) = calculate_group_qparams(&[0.0; 4], &args);
        assert_eq!(scale, f32::EPSILON);
        assert_eq!(zp, 0);
    }

    #[test]
    fn test_channel_round_trip_within_half_scale() {
        let data = vec![0.3, -1.2, 0.9, 0.01, 2.0, -0.5, 0.25, -2.0];
        let shape = [2, 4];
        let args = QuantizationArgs::int8_channel();
        let qparams = calculate_qparams(&data, &shape, &args).unwrap();
        assert_eq!(qparams.scales.len(), 2);
        assert!(qparams.zero_points.is_none());

        let codes = quantize_matrix(&data, &shape, &args, &qparams).unwrap();
        let restored = dequantize_matrix(&codes, &shape, &args, &qparams).unwrap();
        for (i, (&w, &r)) in data.iter().zip(&restored).enumerate() {
            let scale = qparams.scales[i / 4];
            assert!((w - r).abs() <= scale / 2.0 + 1e-6, "{w} vs {r}");
        }
    }

    #[test]
    fn test_group_qparams_count() {
        let data: Vec<f32> = (0..32).map(|i| i as f32 - 16.0).collect();
        let args = QuantizationArgs::int4_group(4, false);
        let qparams = calculate_qparams(&data, &[2, 16], &args).unwrap();
        assert_eq!(qparams.scales.len(), 8);
        assert_eq!(qparams.zero_points.as_ref().map(Vec::len), Some(8));
    }

    #[test]
    fn test_tensor_strategy_single_scale() {
        let args = QuantizationArgs::int8_channel().with_strategy(QuantizationStrategy::Tensor);
        let qparams = calculate_qparams(&[1.0, -4.0, 2.0, 3.0], &[2, 2], &args).unwrap();
        assert_eq!(qparams.scales.len(), 1);
    }

    #[test]
    fn test_quantize_rejects_wrong_scale_count() {
        let args = QuantizationArgs::int8_channel();
        let qparams = QParams { scales: vec![1.0], zero_points: None };
        assert!(quantize_matrix(&[0.0; 4], &[2, 2], &args, &qparams).is_err());
    }

    #[test]
    fn test_quantize_rejects_out_of_range_bits() {
        let qparams = QParams { scales: vec![1.0, 1.0], zero_points: None };
        for bits in [0u8, 9] {
            let args = QuantizationArgs::int8_channel().with_num_bits(bits);
            assert!(matches!(
                quantize_matrix(&[0.0; 4], &[2, 2], &args, &qparams),
                Err(QLayerError::Configuration(_))
            ));
            assert!(matches!(
                dequantize_matrix(&[0; 4], &[2, 2], &args, &qparams),
                Err(QLayerError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_mse() {
        assert_eq!(calculate_mse(&[1.0, 2.0], &[1.0, 4.0]).unwrap(), 2.0);
        assert!(calculate_mse(&[1.0], &[1.0, 2.0]).is_err());
    }
}
