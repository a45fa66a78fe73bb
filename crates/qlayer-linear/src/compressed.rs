//! Linear layer backed by compressed weight storage
//!
//! The dense weight is gone once a [`CompressedLinear`] exists. A
//! full-precision copy is rebuilt on demand by
//! [`refresh_materialized_weight`](CompressedLinear::refresh_materialized_weight)
//! and kept as a gradient-tracking [`Var`] so training steps can read the
//! gradient that reached it.

use crate::dense::DenseLinear;
use crate::forward::linear_forward;
use crate::hooks::{AttachedHook, compressed_forward};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use qlayer_common::{
    ParameterStore, QLayerConfig, QLayerError, QuantizationScheme, QuantizationStatus,
    Result, RuntimeConfig,
};
use qlayer_quantization::{CompressedWeightView, CompressionFormat, FormatRegistry};
use std::sync::Arc;
use tracing::{debug, info};

/// Linear layer whose weight lives only in compressed form.
#[derive(Debug)]
pub struct CompressedLinear {
    in_features: usize,
    out_features: usize,
    bias: Option<Tensor>,
    format: Arc<dyn CompressionFormat>,
    scheme: QuantizationScheme,
    status: QuantizationStatus,
    params: ParameterStore,
    device: Device,
    dense_dtype: DType,
    compute_dtype: DType,
    materialized: Option<Var>,
    captured_gradient: Option<Tensor>,
    pub(crate) hook: Option<AttachedHook>,
}

/// Converts a dense layer into compressed storage form.
///
/// Work that can fail (format resolution, descriptor queries, storage
/// allocation, scheme initialization) happens in [`prepare`](Self::prepare)
/// while the dense weight is still owned by the caller. [`commit`](Self::commit)
/// cannot fail, so a layer is never left half converted. The swapper borrows
/// the layer it prepared for, so storage is always committed against it.
#[derive(Debug)]
pub struct ParameterSwapper<'a> {
    dense: &'a mut DenseLinear,
    format: Arc<dyn CompressionFormat>,
    scheme: QuantizationScheme,
    storage: ParameterStore,
}

impl<'a> ParameterSwapper<'a> {
    pub fn prepare(
        dense: &'a mut DenseLinear,
        scheme: &QuantizationScheme,
        format_id: &str,
        registry: &FormatRegistry,
    ) -> Result<Self> {
        dense.status.ensure_can_advance_to(QuantizationStatus::Compressed)?;
        let format = registry.resolve(format_id)?;
        let args = scheme.weights_args()?;
        args.validate()?;

        let descriptors = format.describe_parameters(dense.weight.dims(), args)?;
        let mut storage = ParameterStore::new();
        for (name, descriptor) in &descriptors {
            storage.register(name.as_str(), descriptor.allocate(name, dense.weight.device())?);
        }

        dense.initialize_for_quantization(scheme, false)?;
        debug!(
            format = format_id,
            params = descriptors.len(),
            bytes = storage.total_bytes(),
            "prepared compressed storage"
        );
        Ok(Self { dense, format, scheme: scheme.clone(), storage })
    }

    /// Move the prepared layer's state into a compressed layer. The dense
    /// weight is not carried over.
    pub fn commit(self) -> CompressedLinear {
        let dense = self.dense;
        let mut params = self.storage;
        for (name, param) in std::mem::take(&mut dense.quantization_params).iter() {
            params.register(name, param.clone());
        }

        let mut hook = dense.hook.take();
        if let Some(hook) = hook.as_mut() {
            hook.rebind_forward(compressed_forward);
        }

        info!(
            format = self.format.name(),
            out_features = dense.out_features,
            in_features = dense.in_features,
            compressed_bytes = params.total_bytes(),
            "converted layer to compressed storage"
        );
        CompressedLinear {
            in_features: dense.in_features,
            out_features: dense.out_features,
            bias: dense.bias.take(),
            format: self.format,
            scheme: self.scheme,
            status: QuantizationStatus::Compressed,
            params,
            device: dense.weight.device().clone(),
            dense_dtype: dense.weight.dtype(),
            compute_dtype: dense.weight.dtype(),
            materialized: None,
            captured_gradient: None,
            hook,
        }
    }
}

impl CompressedLinear {
    /// Convert `dense`, consuming it.
    ///
    /// On failure the dense layer is dropped; use
    /// [`LinearLayer::convert_to_compressed`](crate::LinearLayer::convert_to_compressed)
    /// to keep it.
    pub fn from_dense(
        mut dense: DenseLinear,
        scheme: &QuantizationScheme,
        format_id: &str,
        registry: &FormatRegistry,
    ) -> Result<Self> {
        Ok(ParameterSwapper::prepare(&mut dense, scheme, format_id, registry)?.commit())
    }

    /// Convert `dense` with the format, scheme and runtime settings of `config`.
    pub fn from_config(
        dense: DenseLinear,
        config: &QLayerConfig,
        registry: &FormatRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let mut layer = Self::from_dense(
            dense,
            &config.compression.scheme,
            &config.compression.format,
            registry,
        )?;
        layer.apply_runtime(&config.runtime)?;
        Ok(layer)
    }

    /// Apply device placement and compute dtype.
    pub fn apply_runtime(&mut self, runtime: &RuntimeConfig) -> Result<()> {
        if let Some(dtype) = runtime.compute_dtype {
            self.set_compute_dtype(dtype.to_dtype());
        }
        let device = runtime.device.to_candle()?;
        if !device.same_device(&self.device) {
            self.to_device(&device)?;
        }
        Ok(())
    }

    /// Rebuild the full-precision weight from the compressed parameters.
    ///
    /// Every call decompresses again, so updates made to the store through
    /// [`compressed_parameters_mut`](Self::compressed_parameters_mut) or
    /// [`load_state`](Self::load_state) are picked up.
    pub fn refresh_materialized_weight(&mut self) -> Result<()> {
        let args = self.scheme.weights_args()?;
        let weight_shape = [self.out_features, self.in_features];
        let view = CompressedWeightView {
            params: &self.params,
            args,
            weight_shape: &weight_shape,
            device: &self.device,
        };
        let weight = self.format.decompress(&view)?;
        let weight = weight
            .to_dtype(self.compute_dtype)
            .map_err(|e| QLayerError::allocation("casting materialized weight", e))?;
        let var = Var::from_tensor(&weight)
            .map_err(|e| QLayerError::allocation("materializing weight", e))?;

        self.materialized = Some(var);
        debug!(
            format = self.format.name(),
            shape = ?weight_shape,
            dtype = ?self.compute_dtype,
            "refreshed materialized weight"
        );
        Ok(())
    }

    /// `input · Wᵀ + bias` on the materialized weight.
    ///
    /// Does not refresh: the weight must have been materialized first.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let weight = self
            .materialized
            .as_ref()
            .ok_or_else(|| QLayerError::state("forward invoked before decompression"))?;
        linear_forward(input, weight.as_tensor(), self.bias.as_ref())
    }

    /// Record the gradient that reached the materialized weight.
    ///
    /// Stores a detached host copy, overwriting the previous one. `grads` is
    /// left untouched so the gradient keeps flowing to other consumers. When
    /// the backward pass did not reach the weight, the captured gradient is
    /// cleared.
    pub fn capture_gradient(&mut self, grads: &GradStore) -> Result<()> {
        let weight = self
            .materialized
            .as_ref()
            .ok_or_else(|| QLayerError::state("no materialized weight to capture a gradient for"))?;
        self.captured_gradient = match grads.get(weight.as_tensor()) {
            Some(grad) => Some(grad.to_device(&Device::Cpu)?.detach()),
            None => None,
        };
        debug!(captured = self.captured_gradient.is_some(), "captured weight gradient");
        Ok(())
    }

    /// Run backpropagation from `loss`, capture the weight gradient and hand
    /// back the full gradient store.
    pub fn backward(&mut self, loss: &Tensor) -> Result<GradStore> {
        let grads = loss.backward()?;
        self.capture_gradient(&grads)?;
        Ok(grads)
    }

    pub fn captured_gradient(&self) -> Option<&Tensor> {
        self.captured_gradient.as_ref()
    }

    pub fn materialized_weight(&self) -> Option<&Tensor> {
        self.materialized.as_ref().map(Var::as_tensor)
    }

    /// The materialized weight as a trainable variable.
    pub fn materialized_var(&self) -> Option<&Var> {
        self.materialized.as_ref()
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized.is_some()
    }

    /// Drop the materialized weight; the next forward needs a refresh.
    pub fn clear_materialized_weight(&mut self) {
        self.materialized = None;
    }

    pub fn compressed_parameters(&self) -> &ParameterStore {
        &self.params
    }

    pub fn compressed_parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.params
    }

    /// Load persisted tensors into the pre-allocated storage.
    pub fn load_state(&mut self, state: &ParameterStore) -> Result<()> {
        self.params.load_state(state)?;
        debug!(params = state.len(), "loaded compressed state");
        Ok(())
    }

    /// Change the dtype of future materialized weights.
    pub fn set_compute_dtype(&mut self, dtype: DType) {
        if dtype != self.compute_dtype {
            self.compute_dtype = dtype;
            self.materialized = None;
        }
    }

    /// Move storage and bias to `device`. The materialized weight and the
    /// captured gradient are dropped.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        self.params.to_device(device)?;
        if let Some(bias) = self.bias.as_mut() {
            *bias = bias
                .to_device(device)
                .map_err(|e| QLayerError::allocation("moving bias", e))?;
        }
        self.device = device.clone();
        self.materialized = None;
        self.captured_gradient = None;
        Ok(())
    }

    /// Bytes held by the compressed parameters.
    pub fn compressed_bytes(&self) -> usize {
        self.params.total_bytes()
    }

    /// Bytes the original dense weight occupied.
    pub fn dense_bytes(&self) -> usize {
        self.out_features * self.in_features * self.dense_dtype.size_in_bytes()
    }

    /// Dense bytes over compressed bytes.
    pub fn compression_ratio(&self) -> f32 {
        self.dense_bytes() as f32 / self.compressed_bytes().max(1) as f32
    }

    pub fn format_id(&self) -> &str {
        self.format.name()
    }

    pub fn scheme(&self) -> &QuantizationScheme {
        &self.scheme
    }

    pub fn status(&self) -> QuantizationStatus {
        self.status
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    pub fn hook(&self) -> Option<&AttachedHook> {
        self.hook.as_ref()
    }
}
