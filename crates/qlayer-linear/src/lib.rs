//! Linear layers with compressed weight storage
//!
//! A [`LinearLayer`] starts dense. Conversion replaces its weight by the
//! parameters of a compression format, allocated empty and filled by an
//! external load. Before each forward pass that needs current weights the
//! driver calls `refresh_materialized_weight`, which decompresses into a
//! gradient-tracking full-precision weight; after backpropagation the
//! gradient that reached it can be captured for an optimizer.
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use qlayer_common::{QuantizationArgs, QuantizationScheme};
//! use qlayer_linear::{DenseLinear, LinearLayer};
//! use qlayer_quantization::{FormatRegistry, INT_QUANTIZED};
//!
//! # fn main() -> qlayer_common::Result<()> {
//! let weight = Tensor::randn(0f32, 1.0, (16, 32), &Device::Cpu)?;
//! let mut layer = LinearLayer::from(DenseLinear::new(weight, None)?);
//! let scheme = QuantizationScheme::new(QuantizationArgs::int8_channel());
//! layer.convert_to_compressed(&scheme, INT_QUANTIZED, &FormatRegistry::default())?;
//!
//! // ... load persisted tensors into `compressed_parameters_mut()` ...
//! layer.refresh_materialized_weight()?;
//! let output = layer.forward(&Tensor::ones((4, 32), DType::F32, &Device::Cpu)?)?;
//! # Ok(())
//! # }
//! ```

pub mod compressed;
pub mod dense;
pub mod forward;
pub mod hooks;
mod initialize;
pub mod layer;

pub use compressed::{CompressedLinear, ParameterSwapper};
pub use dense::DenseLinear;
pub use forward::linear_forward;
pub use hooks::{AttachedHook, ForwardFn, ModuleHook, compressed_forward, dense_forward};
pub use layer::LinearLayer;
