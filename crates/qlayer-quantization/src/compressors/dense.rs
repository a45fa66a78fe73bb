//! Identity format: the weight is persisted as `f32`.

use super::{CompressedWeightView, CompressionFormat, DENSE, decompression_failure};
use crate::WEIGHT;
use candle_core::{DType, Tensor};
use qlayer_common::{
    ParamDType, Parameter, ParameterDescriptor, ParameterDescriptors, ParameterStore, QLayerError,
    QuantizationArgs, Result, matrix_dims,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct DenseFormat;

impl CompressionFormat for DenseFormat {
    fn name(&self) -> &str {
        DENSE
    }

    fn describe_parameters(
        &self,
        weight_shape: &[usize],
        _args: &QuantizationArgs,
    ) -> Result<ParameterDescriptors> {
        matrix_dims(weight_shape)?;
        let mut descriptors = ParameterDescriptors::new();
        descriptors.insert(WEIGHT.to_string(), ParameterDescriptor::new(weight_shape, ParamDType::F32));
        Ok(descriptors)
    }

    fn compress(
        &self,
        weight: &Tensor,
        qparams: &ParameterStore,
        _args: &QuantizationArgs,
    ) -> Result<ParameterStore> {
        let mut out = qparams.clone();
        out.register(WEIGHT, Parameter::new(weight.to_dtype(DType::F32)?, ParamDType::F32)?);
        Ok(out)
    }

    fn decompress(&self, view: &CompressedWeightView<'_>) -> Result<Tensor> {
        let rebuild = || -> Result<Tensor> {
            let weight = view.params.require(WEIGHT)?.tensor();
            if weight.dims() != view.weight_shape {
                return Err(QLayerError::decompression(format!(
                    "stored weight {:?} does not match layer shape {:?}",
                    weight.dims(),
                    view.weight_shape
                )));
            }
            // Copy so the materialized weight never aliases persisted storage.
            Ok(weight.to_device(view.device)?.copy()?)
        };
        rebuild().map_err(|e| decompression_failure(DENSE, e))
    }
}

#[cfg(all(test, feature = "cpu"))]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_dense_is_exact() {
        let weight = Tensor::new(&[[0.123f32, -4.5], [1e-8, 3.0]], &Device::Cpu).unwrap();
        let store = DenseFormat
            .compress(&weight, &ParameterStore::new(), &QuantizationArgs::default())
            .unwrap();
        let args = QuantizationArgs::default();
        let view = CompressedWeightView {
            params: &store,
            args: &args,
            weight_shape: &[2, 2],
            device: &Device::Cpu,
        };
        let restored = DenseFormat.decompress(&view).unwrap();
        assert_eq!(restored.to_vec2::<f32>().unwrap(), weight.to_vec2::<f32>().unwrap());
    }
}
