//! Weight compression formats for compressed linear layers
//!
//! This crate provides:
//! - `int-quantized`: unpacked `i8` integer codes
//! - `pack-quantized`: 1/2/4/8-bit codes packed into 32-bit words
//! - `dense`: the identity format, useful as a baseline
//!
//! Formats are resolved by identifier through a [`FormatRegistry`], which is
//! open for registration of further encodings. Scale and zero-point values
//! come from the [`MinMaxObserver`].

pub mod compressors;
pub mod observer;
pub mod utils;

pub use compressors::{
    CompressedWeightView, CompressionFormat, DENSE, DenseFormat, FormatRegistry, INT_QUANTIZED,
    IntQuantizedFormat, PACK_QUANTIZED, PackQuantizedFormat,
};
pub use observer::{MinMaxObserver, qparam_descriptors, qparams_from_store, qparams_to_store};
pub use utils::QParams;

use candle_core::Tensor;
use qlayer_common::{ParameterStore, QuantizationArgs, Result};

/// Name of the unpacked integer weight parameter.
pub const WEIGHT: &str = "weight";
/// Name of the packed weight parameter.
pub const WEIGHT_PACKED: &str = "weight_packed";
/// Name of the stored original weight shape.
pub const WEIGHT_SHAPE: &str = "weight_shape";
/// Name of the scale parameter.
pub const WEIGHT_SCALE: &str = "weight_scale";
/// Name of the zero-point parameter.
pub const WEIGHT_ZERO_POINT: &str = "weight_zero_point";

/// Observe `weight`, then encode it with `format`.
///
/// This is the producer side of a compressed checkpoint: the returned store
/// holds every tensor a compressed layer expects to be loaded.
pub fn compress_weight(
    format: &dyn CompressionFormat,
    weight: &Tensor,
    args: &QuantizationArgs,
) -> Result<ParameterStore> {
    let qparams = MinMaxObserver::new().observe(weight, args)?;
    let store = qparams_to_store(&qparams, args, weight.dims(), weight.device())?;
    format.compress(weight, &store, args)
}
