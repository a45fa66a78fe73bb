//! Compression formats and the registry that resolves them by identifier

mod dense;
mod int_quantized;
mod pack_quantized;

pub use dense::DenseFormat;
pub use int_quantized::IntQuantizedFormat;
pub use pack_quantized::PackQuantizedFormat;

use candle_core::{Device, Tensor};
use qlayer_common::{ParameterDescriptors, ParameterStore, QLayerError, QuantizationArgs, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Identifier of [`IntQuantizedFormat`].
pub const INT_QUANTIZED: &str = "int-quantized";
/// Identifier of [`PackQuantizedFormat`].
pub const PACK_QUANTIZED: &str = "pack-quantized";
/// Identifier of [`DenseFormat`].
pub const DENSE: &str = "dense";

/// Everything a format needs to rebuild a weight from its stored parameters.
#[derive(Debug, Clone, Copy)]
pub struct CompressedWeightView<'a> {
    pub params: &'a ParameterStore,
    pub args: &'a QuantizationArgs,
    /// Original dense weight shape, `(out, in)`.
    pub weight_shape: &'a [usize],
    pub device: &'a Device,
}

/// A compression encoding for linear layer weights.
///
/// Implementations describe the persisted parameters for a given weight
/// shape, produce them from a dense weight, and reconstruct an `f32` weight
/// from them.
pub trait CompressionFormat: Send + Sync + fmt::Debug {
    /// Registry identifier, e.g. `"int-quantized"`.
    fn name(&self) -> &str;

    /// Shapes and dtypes of the parameters this format persists, excluding
    /// the scale / zero-point parameters owned by the scheme.
    fn describe_parameters(
        &self,
        weight_shape: &[usize],
        args: &QuantizationArgs,
    ) -> Result<ParameterDescriptors>;

    /// Encode `weight` with the given qparams. The returned store also
    /// carries copies of the qparams, so it can be loaded as a whole.
    fn compress(
        &self,
        weight: &Tensor,
        qparams: &ParameterStore,
        args: &QuantizationArgs,
    ) -> Result<ParameterStore>;

    /// Rebuild the full-precision `f32` weight on `view.device`.
    fn decompress(&self, view: &CompressedWeightView<'_>) -> Result<Tensor>;
}

/// Route a failure inside `decompress` into the error taxonomy.
///
/// Allocation failures stay `Resource`; everything else becomes
/// `Decompression`.
pub(crate) fn decompression_failure(format: &str, err: QLayerError) -> QLayerError {
    match err {
        QLayerError::Resource(_) | QLayerError::Decompression(_) => err,
        other => QLayerError::decompression(format!("{format}: {other}")),
    }
}

/// Identifier → format map. Open for registration.
#[derive(Clone)]
pub struct FormatRegistry {
    formats: HashMap<String, Arc<dyn CompressionFormat>>,
}

impl FormatRegistry {
    /// Registry without any format.
    pub fn empty() -> Self {
        Self { formats: HashMap::new() }
    }

    /// Registry holding the built-in formats.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(IntQuantizedFormat));
        registry.register(Arc::new(PackQuantizedFormat));
        registry.register(Arc::new(DenseFormat));
        registry
    }

    /// Register under `format.name()`, returning the replaced format if any.
    pub fn register(
        &mut self,
        format: Arc<dyn CompressionFormat>,
    ) -> Option<Arc<dyn CompressionFormat>> {
        self.formats.insert(format.name().to_string(), format)
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn CompressionFormat>> {
        match self.formats.get(id) {
            Some(format) => {
                debug!(format = id, "resolved compression format");
                Ok(Arc::clone(format))
            }
            None => Err(QLayerError::config(format!(
                "unknown compression format `{id}` (known: {})",
                self.identifiers().join(", ")
            ))),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.formats.contains_key(id)
    }

    /// Sorted identifiers.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.formats.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatRegistry").field("formats", &self.identifiers()).finish()
    }
}
