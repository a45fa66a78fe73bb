//! A linear layer that is either dense or compressed

use crate::compressed::{CompressedLinear, ParameterSwapper};
use crate::dense::DenseLinear;
use crate::hooks::{AttachedHook, ModuleHook, compressed_forward, dense_forward};
use candle_core::Tensor;
use qlayer_common::{QLayerConfig, QLayerError, QuantizationScheme, QuantizationStatus, Result};
use qlayer_quantization::FormatRegistry;
use std::sync::Arc;

/// Linear layer in one of its two storage forms.
///
/// A dense layer owns a full-precision weight and no compressed storage; a
/// compressed layer owns compressed storage and no dense weight.
#[derive(Debug)]
pub enum LinearLayer {
    Dense(DenseLinear),
    Compressed(CompressedLinear),
}

impl From<DenseLinear> for LinearLayer {
    fn from(layer: DenseLinear) -> Self {
        Self::Dense(layer)
    }
}

impl From<CompressedLinear> for LinearLayer {
    fn from(layer: CompressedLinear) -> Self {
        Self::Compressed(layer)
    }
}

impl LinearLayer {
    /// Replace the dense weight by compressed storage for `format_id`.
    ///
    /// Any attached hook is rebound to the compressed forward. On error the
    /// layer is left as it was.
    pub fn convert_to_compressed(
        &mut self,
        scheme: &QuantizationScheme,
        format_id: &str,
        registry: &FormatRegistry,
    ) -> Result<()> {
        let LinearLayer::Dense(dense) = self else {
            return Err(QLayerError::state("layer is already compressed; no dense weight to convert"));
        };
        let compressed = ParameterSwapper::prepare(dense, scheme, format_id, registry)?.commit();
        *self = LinearLayer::Compressed(compressed);
        Ok(())
    }

    /// [`convert_to_compressed`](Self::convert_to_compressed) driven by `config`.
    pub fn convert_with_config(&mut self, config: &QLayerConfig, registry: &FormatRegistry) -> Result<()> {
        config.validate()?;
        self.convert_to_compressed(&config.compression.scheme, &config.compression.format, registry)?;
        match self {
            LinearLayer::Compressed(compressed) => compressed.apply_runtime(&config.runtime),
            LinearLayer::Dense(_) => Err(QLayerError::state("conversion left the layer dense")),
        }
    }

    /// Decompress into the materialized weight. Dense layers have no bound
    /// format to decompress with.
    pub fn refresh_materialized_weight(&mut self) -> Result<()> {
        match self {
            LinearLayer::Compressed(compressed) => compressed.refresh_materialized_weight(),
            LinearLayer::Dense(_) => {
                Err(QLayerError::decompression("no compression format bound to a dense layer"))
            }
        }
    }

    /// Run the forward pass, through the attached hook when there is one.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match self.hook() {
            Some(hook) => hook.run(self, input),
            None => match self {
                LinearLayer::Dense(dense) => dense.forward(input),
                LinearLayer::Compressed(compressed) => compressed.forward(input),
            },
        }
    }

    /// Wrap the forward entry point with `hook`, replacing any previous one.
    pub fn attach_hook(&mut self, hook: Arc<dyn ModuleHook>) {
        match self {
            LinearLayer::Dense(dense) => {
                dense.hook = Some(AttachedHook::new(hook, dense_forward));
            }
            LinearLayer::Compressed(compressed) => {
                compressed.hook = Some(AttachedHook::new(hook, compressed_forward));
            }
        }
    }

    pub fn detach_hook(&mut self) -> Option<AttachedHook> {
        match self {
            LinearLayer::Dense(dense) => dense.hook.take(),
            LinearLayer::Compressed(compressed) => compressed.hook.take(),
        }
    }

    pub fn hook(&self) -> Option<&AttachedHook> {
        match self {
            LinearLayer::Dense(dense) => dense.hook.as_ref(),
            LinearLayer::Compressed(compressed) => compressed.hook(),
        }
    }

    /// The dense weight; fails once the layer is compressed.
    pub fn weight(&self) -> Result<&Tensor> {
        match self {
            LinearLayer::Dense(dense) => Ok(dense.weight()),
            LinearLayer::Compressed(_) => {
                Err(QLayerError::state("dense weight was released at compression"))
            }
        }
    }

    pub fn bias(&self) -> Option<&Tensor> {
        match self {
            LinearLayer::Dense(dense) => dense.bias(),
            LinearLayer::Compressed(compressed) => compressed.bias(),
        }
    }

    pub fn status(&self) -> QuantizationStatus {
        match self {
            LinearLayer::Dense(dense) => dense.status(),
            LinearLayer::Compressed(compressed) => compressed.status(),
        }
    }

    pub fn in_features(&self) -> usize {
        match self {
            LinearLayer::Dense(dense) => dense.in_features(),
            LinearLayer::Compressed(compressed) => compressed.in_features(),
        }
    }

    pub fn out_features(&self) -> usize {
        match self {
            LinearLayer::Dense(dense) => dense.out_features(),
            LinearLayer::Compressed(compressed) => compressed.out_features(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, LinearLayer::Compressed(_))
    }

    pub fn as_dense(&self) -> Option<&DenseLinear> {
        match self {
            LinearLayer::Dense(dense) => Some(dense),
            LinearLayer::Compressed(_) => None,
        }
    }

    pub fn as_dense_mut(&mut self) -> Option<&mut DenseLinear> {
        match self {
            LinearLayer::Dense(dense) => Some(dense),
            LinearLayer::Compressed(_) => None,
        }
    }

    pub fn as_compressed(&self) -> Option<&CompressedLinear> {
        match self {
            LinearLayer::Compressed(compressed) => Some(compressed),
            LinearLayer::Dense(_) => None,
        }
    }

    pub fn as_compressed_mut(&mut self) -> Option<&mut CompressedLinear> {
        match self {
            LinearLayer::Compressed(compressed) => Some(compressed),
            LinearLayer::Dense(_) => None,
        }
    }
}

#[cfg(all(test, feature = "cpu"))]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use qlayer_common::QuantizationArgs;
    use qlayer_quantization::INT_QUANTIZED;

    fn layer() -> LinearLayer {
        let weight = Tensor::new(&[[1.0f32, -1.0], [0.5, 2.0]], &Device::Cpu).unwrap();
        DenseLinear::new(weight, None).unwrap().into()
    }

    #[test]
    fn test_convert_in_place() {
        let mut layer = layer();
        let scheme = QuantizationScheme::new(QuantizationArgs::int8_channel());
        layer.convert_to_compressed(&scheme, INT_QUANTIZED, &FormatRegistry::default()).unwrap();
        assert!(layer.is_compressed());
        assert_eq!(layer.status(), QuantizationStatus::Compressed);
        assert!(matches!(layer.weight(), Err(QLayerError::State(_))));
        assert!(!layer.as_compressed().unwrap().compressed_parameters().is_empty());
    }

    #[test]
    fn test_unknown_format_keeps_dense_layer() {
        let mut layer = layer();
        let scheme = QuantizationScheme::new(QuantizationArgs::int8_channel());
        let err = layer
            .convert_to_compressed(&scheme, "nf4-unknown", &FormatRegistry::default())
            .unwrap_err();
        assert!(matches!(err, QLayerError::Configuration(_)));
        assert!(!layer.is_compressed());
        assert_eq!(layer.weight().unwrap().dims(), &[2, 2]);
    }

    #[test]
    fn test_second_conversion_is_state_error() {
        let mut layer = layer();
        let scheme = QuantizationScheme::new(QuantizationArgs::int8_channel());
        let registry = FormatRegistry::default();
        layer.convert_to_compressed(&scheme, INT_QUANTIZED, &registry).unwrap();
        assert!(matches!(
            layer.convert_to_compressed(&scheme, INT_QUANTIZED, &registry),
            Err(QLayerError::State(_))
        ));
    }

    #[test]
    fn test_refresh_on_dense_layer_is_decompression_error() {
        let mut layer = layer();
        assert!(matches!(layer.refresh_materialized_weight(), Err(QLayerError::Decompression(_))));
        let input = Tensor::ones((3, 2), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(layer.forward(&input).unwrap().dims(), &[3, 2]);
    }
}
