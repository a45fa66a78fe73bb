//! Sub-byte integer codes packed into 32-bit words.
//!
//! Layout: `weight_packed` is `(out, ceil(in / (32 / bits)))` `i32` words,
//! each holding `32 / bits` codes offset by `2^(bits-1)`, lowest bits first.
//! `weight_shape` is a `(2,)` `i32` tensor recording `[out, in]` so the
//! padding in the last word of each row can be dropped on unpack.

use super::{CompressedWeightView, CompressionFormat, PACK_QUANTIZED, decompression_failure};
use crate::observer::qparams_from_store;
use crate::utils::{codes_per_word, dequantize_matrix, extract_f32_data, pack_codes, quantize_matrix, unpack_codes};
use crate::{WEIGHT_PACKED, WEIGHT_SHAPE};
use candle_core::Tensor;
use qlayer_common::{
    ParamDType, Parameter, ParameterDescriptor, ParameterDescriptors, ParameterStore, QLayerError,
    QuantizationArgs, Result, matrix_dims,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct PackQuantizedFormat;

impl CompressionFormat for PackQuantizedFormat {
    fn name(&self) -> &str {
        PACK_QUANTIZED
    }

    fn describe_parameters(
        &self,
        weight_shape: &[usize],
        args: &QuantizationArgs,
    ) -> Result<ParameterDescriptors> {
        args.validate()?;
        let (out_features, in_features) = matrix_dims(weight_shape)?;
        let per_word = codes_per_word(args.num_bits)?;

        let mut descriptors = ParameterDescriptors::new();
        descriptors.insert(
            WEIGHT_PACKED.to_string(),
            ParameterDescriptor::new([out_features, in_features.div_ceil(per_word)], ParamDType::I32),
        );
        descriptors.insert(WEIGHT_SHAPE.to_string(), ParameterDescriptor::new([2], ParamDType::I32));
        Ok(descriptors)
    }

    fn compress(
        &self,
        weight: &Tensor,
        qparams: &ParameterStore,
        args: &QuantizationArgs,
    ) -> Result<ParameterStore> {
        args.validate()?;
        let shape = weight.dims().to_vec();
        let (out_features, in_features) = matrix_dims(&shape)?;
        let values = extract_f32_data(weight)?;
        let codes = quantize_matrix(&values, &shape, args, &qparams_from_store(qparams, args)?)?;
        let words = pack_codes(&codes, out_features, in_features, args.num_bits)?;
        let words: Vec<i32> = words.into_iter().map(|w| w as i32).collect();

        let device = weight.device();
        let words_per_row = in_features.div_ceil(codes_per_word(args.num_bits)?);
        let mut out = qparams.clone();
        out.register(WEIGHT_PACKED, Parameter::from_i32(&words, &[out_features, words_per_row], device)?);
        out.register(
            WEIGHT_SHAPE,
            Parameter::from_i32(&[out_features as i32, in_features as i32], &[2], device)?,
        );
        Ok(out)
    }

    fn decompress(&self, view: &CompressedWeightView<'_>) -> Result<Tensor> {
        let rebuild = || -> Result<Tensor> {
            let stored = view.params.require(WEIGHT_SHAPE)?.to_i32_vec()?;
            let (out_features, in_features) = matrix_dims(view.weight_shape)?;
            if stored != [out_features as i32, in_features as i32] {
                return Err(QLayerError::decompression(format!(
                    "stored weight_shape {stored:?} does not match layer shape {:?}",
                    view.weight_shape
                )));
            }

            let words: Vec<u32> = view
                .params
                .require(WEIGHT_PACKED)?
                .to_i32_vec()?
                .into_iter()
                .map(|w| w as u32)
                .collect();
            let codes = unpack_codes(&words, out_features, in_features, view.args.num_bits)?;
            let qparams = qparams_from_store(view.params, view.args)?;
            let values = dequantize_matrix(&codes, view.weight_shape, view.args, &qparams)?;
            Ok(Tensor::from_vec(values, view.weight_shape, view.device)?)
        };
        rebuild().map_err(|e| decompression_failure(PACK_QUANTIZED, e))
    }
}
