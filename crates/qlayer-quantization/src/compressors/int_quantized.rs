//! One signed 8-bit container per weight element.

use super::{CompressedWeightView, CompressionFormat, INT_QUANTIZED, decompression_failure};
use crate::observer::qparams_from_store;
use crate::utils::{dequantize_matrix, extract_f32_data, quantize_matrix};
use crate::WEIGHT;
use candle_core::Tensor;
use qlayer_common::{
    ParamDType, Parameter, ParameterDescriptor, ParameterDescriptors, ParameterStore,
    QuantizationArgs, Result, matrix_dims,
};

/// Integer codes stored unpacked as `i8`, same shape as the dense weight.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntQuantizedFormat;

impl CompressionFormat for IntQuantizedFormat {
    fn name(&self) -> &str {
        INT_QUANTIZED
    }

    fn describe_parameters(
        &self,
        weight_shape: &[usize],
        args: &QuantizationArgs,
    ) -> Result<ParameterDescriptors> {
        args.validate()?;
        matrix_dims(weight_shape)?;
        let mut descriptors = ParameterDescriptors::new();
        descriptors.insert(WEIGHT.to_string(), ParameterDescriptor::new(weight_shape, ParamDType::I8));
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
        let values = extract_f32_data(weight)?;
        let codes = quantize_matrix(&values, &shape, args, &qparams_from_store(qparams, args)?)?;

        let mut out = qparams.clone();
        out.register(WEIGHT, Parameter::from_i8(&codes, &shape, weight.device())?);
        Ok(out)
    }

    fn decompress(&self, view: &CompressedWeightView<'_>) -> Result<Tensor> {
        let rebuild = || -> Result<Tensor> {
            let codes = view.params.require(WEIGHT)?.to_i8_vec()?;
            let qparams = qparams_from_store(view.params, view.args)?;
            let values = dequantize_matrix(&codes, view.weight_shape, view.args, &qparams)?;
            Ok(Tensor::from_vec(values, view.weight_shape, view.device)?)
        };
        rebuild().map_err(|e| decompression_failure(INT_QUANTIZED, e))
    }
}
