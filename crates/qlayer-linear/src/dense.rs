//! Full-precision linear layer, the starting point of every conversion

use crate::forward::linear_forward;
use crate::hooks::AttachedHook;
use candle_core::{DType, Device, Tensor};
use qlayer_common::{
    ParameterStore, QLayerError, QuantizationScheme, QuantizationStatus, Result, matrix_dims,
};

/// Linear layer holding a dense `(out_features, in_features)` weight.
///
/// Before compression the layer may also carry the scale / zero-point
/// parameters attached by [`initialize_for_quantization`](Self::initialize_for_quantization).
#[derive(Debug, Clone)]
pub struct DenseLinear {
    pub(crate) weight: Tensor,
    pub(crate) bias: Option<Tensor>,
    pub(crate) in_features: usize,
    pub(crate) out_features: usize,
    pub(crate) status: QuantizationStatus,
    pub(crate) scheme: Option<QuantizationScheme>,
    pub(crate) quantization_params: ParameterStore,
    pub(crate) hook: Option<AttachedHook>,
}

impl DenseLinear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, in_features) = matrix_dims(weight.dims())?;
        if let Some(bias) = &bias {
            if bias.dims() != [out_features] {
                return Err(QLayerError::ShapeMismatch {
                    input: bias.dims().to_vec(),
                    weight: vec![out_features, in_features],
                });
            }
        }
        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
            status: QuantizationStatus::Uninitialized,
            scheme: None,
            quantization_params: ParameterStore::new(),
            hook: None,
        })
    }

    /// Zero weight and no bias, mostly useful as a load target.
    pub fn zeros(in_features: usize, out_features: usize, dtype: DType, device: &Device) -> Result<Self> {
        Self::new(Tensor::zeros((out_features, in_features), dtype, device)?, None)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn status(&self) -> QuantizationStatus {
        self.status
    }

    pub fn device(&self) -> &Device {
        self.weight.device()
    }

    /// Scheme attached by the initializer, if any.
    pub fn scheme(&self) -> Option<&QuantizationScheme> {
        self.scheme.as_ref()
    }

    /// Scale / zero-point parameters attached by the initializer.
    pub fn quantization_params(&self) -> &ParameterStore {
        &self.quantization_params
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        linear_forward(input, &self.weight, self.bias.as_ref())
    }
}
