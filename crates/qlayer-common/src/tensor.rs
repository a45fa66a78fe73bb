//! Named parameter storage for compressed layers
//!
//! A [`ParameterStore`] holds the persisted tensors of a compressed layer
//! (packed weight, scale, zero-point, ...). Entries never track gradients and
//! are replaced wholesale, keeping the slot's shape and dtype.

use crate::{ParamDType, QLayerError, Result};
use candle_core::{Device, Tensor};
use std::collections::BTreeMap;

/// Shape and dtype of one compressed parameter, as described by a format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDescriptor {
    pub shape: Vec<usize>,
    pub dtype: ParamDType,
}

impl ParameterDescriptor {
    pub fn new(shape: impl Into<Vec<usize>>, dtype: ParamDType) -> Self {
        Self { shape: shape.into(), dtype }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }

    /// Allocate zero-filled storage for this descriptor on `device`.
    pub fn allocate(&self, name: &str, device: &Device) -> Result<Parameter> {
        let tensor = Tensor::zeros(self.shape.as_slice(), self.dtype.storage_dtype(), device)
            .map_err(|e| QLayerError::allocation(&format!("allocating `{name}`"), e))?;
        Ok(Parameter { tensor, dtype: self.dtype })
    }
}

/// Descriptor set returned by a compression format, keyed by parameter name.
pub type ParameterDescriptors = BTreeMap<String, ParameterDescriptor>;

/// A persisted, non-trainable tensor together with its logical dtype.
#[derive(Debug, Clone)]
pub struct Parameter {
    tensor: Tensor,
    dtype: ParamDType,
}

impl Parameter {
    /// Wrap a tensor whose storage dtype matches `dtype`.
    pub fn new(tensor: Tensor, dtype: ParamDType) -> Result<Self> {
        if tensor.dtype() != dtype.storage_dtype() {
            return Err(QLayerError::InvalidParameter {
                name: String::from("<anonymous>"),
                reason: format!(
                    "{dtype} parameters are stored as {:?}, got {:?}",
                    dtype.storage_dtype(),
                    tensor.dtype()
                ),
            });
        }
        Ok(Self { tensor: tensor.detach(), dtype })
    }

    pub fn from_f32(values: Vec<f32>, shape: &[usize], device: &Device) -> Result<Self> {
        let tensor = Tensor::from_vec(values, shape, device)?;
        Ok(Self { tensor, dtype: ParamDType::F32 })
    }

    pub fn from_i8(values: &[i8], shape: &[usize], device: &Device) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let tensor = Tensor::from_slice(bytes, shape, device)?;
        Ok(Self { tensor, dtype: ParamDType::I8 })
    }

    pub fn from_i32(values: &[i32], shape: &[usize], device: &Device) -> Result<Self> {
        let words: &[u32] = bytemuck::cast_slice(values);
        let tensor = Tensor::from_slice(words, shape, device)?;
        Ok(Self { tensor, dtype: ParamDType::I32 })
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn dtype(&self) -> ParamDType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.dims()
    }

    pub fn descriptor(&self) -> ParameterDescriptor {
        ParameterDescriptor::new(self.shape(), self.dtype)
    }

    pub fn size_in_bytes(&self) -> usize {
        self.descriptor().size_in_bytes()
    }

    fn host_flat(&self) -> Result<Tensor> {
        Ok(self.tensor.flatten_all()?.to_device(&Device::Cpu)?)
    }

    /// Values as `f32`, converting from any float dtype.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if !self.dtype.is_float() {
            return Err(QLayerError::invalid_parameter(
                "<anonymous>",
                format!("expected a float parameter, found {}", self.dtype),
            ));
        }
        Ok(self.host_flat()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?)
    }

    pub fn to_i8_vec(&self) -> Result<Vec<i8>> {
        if self.dtype != ParamDType::I8 {
            return Err(QLayerError::invalid_parameter(
                "<anonymous>",
                format!("expected an i8 parameter, found {}", self.dtype),
            ));
        }
        let bytes = self.host_flat()?.to_vec1::<u8>()?;
        Ok(bytemuck::cast_slice::<u8, i8>(&bytes).to_vec())
    }

    pub fn to_i32_vec(&self) -> Result<Vec<i32>> {
        if self.dtype != ParamDType::I32 {
            return Err(QLayerError::invalid_parameter(
                "<anonymous>",
                format!("expected an i32 parameter, found {}", self.dtype),
            ));
        }
        let words = self.host_flat()?.to_vec1::<u32>()?;
        Ok(bytemuck::cast_slice::<u32, i32>(&words).to_vec())
    }
}

/// Ordered name → parameter map owned by one layer.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    params: BTreeMap<String, Parameter>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter under `name`, returning any previous entry.
    pub fn register(&mut self, name: impl Into<String>, param: Parameter) -> Option<Parameter> {
        self.params.insert(name.into(), param)
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    /// Like [`get`](Self::get) but missing entries are an error.
    pub fn require(&self, name: &str) -> Result<&Parameter> {
        self.params
            .get(name)
            .ok_or_else(|| QLayerError::invalid_parameter(name, "parameter is not registered"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Parameter> {
        self.params.remove(name)
    }

    /// Replace the contents of an existing slot.
    ///
    /// The incoming tensor must match the slot's shape and storage dtype; it
    /// is moved to the slot's device and detached from any graph.
    pub fn load(&mut self, name: &str, tensor: &Tensor) -> Result<()> {
        let slot = self
            .params
            .get_mut(name)
            .ok_or_else(|| QLayerError::invalid_parameter(name, "no storage allocated"))?;
        if tensor.dims() != slot.shape() {
            return Err(QLayerError::invalid_parameter(
                name,
                format!("shape {:?} does not match storage {:?}", tensor.dims(), slot.shape()),
            ));
        }
        if tensor.dtype() != slot.tensor.dtype() {
            return Err(QLayerError::invalid_parameter(
                name,
                format!(
                    "dtype {:?} does not match storage {:?} ({})",
                    tensor.dtype(),
                    slot.tensor.dtype(),
                    slot.dtype
                ),
            ));
        }
        let device = slot.tensor.device().clone();
        slot.tensor = tensor.to_device(&device)?.detach();
        Ok(())
    }

    /// Load a parameter, additionally checking its logical dtype.
    pub fn load_parameter(&mut self, name: &str, param: &Parameter) -> Result<()> {
        let expected = self.require(name)?.dtype;
        if param.dtype != expected {
            return Err(QLayerError::invalid_parameter(
                name,
                format!("logical dtype {} does not match storage {expected}", param.dtype),
            ));
        }
        self.load(name, &param.tensor)
    }

    /// Load every entry of `state` into the matching pre-allocated slot.
    pub fn load_state(&mut self, state: &ParameterStore) -> Result<()> {
        for (name, param) in state.iter() {
            self.load_parameter(name, param)?;
        }
        Ok(())
    }

    /// Move every entry to `device`.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        for (name, param) in self.params.iter_mut() {
            param.tensor = param
                .tensor
                .to_device(device)
                .map_err(|e| QLayerError::allocation(&format!("moving `{name}`"), e))?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.params.values().map(Parameter::size_in_bytes).sum()
    }

    pub fn descriptors(&self) -> ParameterDescriptors {
        self.params.iter().map(|(k, v)| (k.clone(), v.descriptor())).collect()
    }
}
