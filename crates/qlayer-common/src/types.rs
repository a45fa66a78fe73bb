//! Quantization scheme, lifecycle status and dtype descriptions

use crate::{QLayerError, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Granularity at which scale / zero-point parameters are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationStrategy {
    /// One scale for the whole weight.
    Tensor,
    /// One scale per output row.
    Channel,
    /// One scale per `group_size` contiguous input columns of each row.
    Group,
}

impl fmt::Display for QuantizationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantizationStrategy::Tensor => write!(f, "tensor"),
            QuantizationStrategy::Channel => write!(f, "channel"),
            QuantizationStrategy::Group => write!(f, "group"),
        }
    }
}

impl FromStr for QuantizationStrategy {
    type Err = QLayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tensor" => Ok(Self::Tensor),
            "channel" => Ok(Self::Channel),
            "group" => Ok(Self::Group),
            other => Err(QLayerError::config(format!("unknown quantization strategy: {other}"))),
        }
    }
}

/// Integer quantization arguments for one tensor (the weights sub-scheme).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationArgs {
    pub num_bits: u8,
    pub symmetric: bool,
    pub strategy: QuantizationStrategy,
    #[serde(default)]
    pub group_size: Option<usize>,
}

impl Default for QuantizationArgs {
    fn default() -> Self {
        Self::int8_channel()
    }
}

impl QuantizationArgs {
    /// 8-bit symmetric, one scale per output channel.
    pub fn int8_channel() -> Self {
        Self {
            num_bits: 8,
            symmetric: true,
            strategy: QuantizationStrategy::Channel,
            group_size: None,
        }
    }

    /// 4-bit grouped quantization.
    pub fn int4_group(group_size: usize, symmetric: bool) -> Self {
        Self {
            num_bits: 4,
            symmetric,
            strategy: QuantizationStrategy::Group,
            group_size: Some(group_size),
        }
    }

    pub fn with_strategy(mut self, strategy: QuantizationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_symmetric(mut self, symmetric: bool) -> Self {
        self.symmetric = symmetric;
        self
    }

    pub fn with_num_bits(mut self, num_bits: u8) -> Self {
        self.num_bits = num_bits;
        self
    }

    /// Signed integer code range `[q_min, q_max]`.
    ///
    /// Widths outside `1..=8` are clamped; [`validate`](Self::validate)
    /// rejects them before any encoding happens.
    pub fn q_range(&self) -> (i32, i32) {
        let half = 1i32 << (self.num_bits.clamp(1, 8) - 1);
        (-half, half - 1)
    }

    /// Asymmetric schemes carry a zero-point.
    pub fn uses_zero_point(&self) -> bool {
        !self.symmetric
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=8).contains(&self.num_bits) {
            return Err(QLayerError::config(format!(
                "num_bits must be in 1..=8 for integer quantization, got {}",
                self.num_bits
            )));
        }
        match (self.strategy, self.group_size) {
            (QuantizationStrategy::Group, None) | (QuantizationStrategy::Group, Some(0)) => {
                Err(QLayerError::config("group strategy requires a non-zero group_size"))
            }
            (QuantizationStrategy::Group, Some(_)) => Ok(()),
            (strategy, Some(g)) => Err(QLayerError::config(format!(
                "group_size {g} is only valid with the group strategy, not {strategy}"
            ))),
            (_, None) => Ok(()),
        }
    }

    /// Number of scale entries per output row.
    pub fn groups_per_row(&self, in_features: usize) -> Result<usize> {
        match self.strategy {
            QuantizationStrategy::Tensor | QuantizationStrategy::Channel => Ok(1),
            QuantizationStrategy::Group => {
                let g = self.group_size.unwrap_or(0);
                if g == 0 || in_features % g != 0 {
                    return Err(QLayerError::config(format!(
                        "group_size {g} does not divide in_features {in_features}"
                    )));
                }
                Ok(in_features / g)
            }
        }
    }

    /// Shape of the scale / zero-point tensors for a `(out, in)` weight.
    pub fn qparam_shape(&self, weight_shape: &[usize]) -> Result<Vec<usize>> {
        self.validate()?;
        let (out_features, in_features) = matrix_dims(weight_shape)?;
        match self.strategy {
            QuantizationStrategy::Tensor => Ok(vec![1]),
            QuantizationStrategy::Channel => Ok(vec![out_features]),
            QuantizationStrategy::Group => {
                Ok(vec![out_features, self.groups_per_row(in_features)?])
            }
        }
    }

    /// Index into the flattened scale tensor for weight element `(row, col)`.
    #[inline]
    pub fn qparam_index(&self, row: usize, col: usize, groups_per_row: usize) -> usize {
        match self.strategy {
            QuantizationStrategy::Tensor => 0,
            QuantizationStrategy::Channel => row,
            QuantizationStrategy::Group => {
                let g = self.group_size.unwrap_or(1).max(1);
                row * groups_per_row + col / g
            }
        }
    }
}

/// Split a 2-D weight shape into `(out_features, in_features)`.
pub fn matrix_dims(shape: &[usize]) -> Result<(usize, usize)> {
    match shape {
        [out_features, in_features] => Ok((*out_features, *in_features)),
        other => Err(QLayerError::config(format!("expected a 2-D weight shape, got {other:?}"))),
    }
}

/// Immutable scheme supplied once at conversion time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationScheme {
    #[serde(default)]
    pub weights: Option<QuantizationArgs>,
}

impl QuantizationScheme {
    pub fn new(weights: QuantizationArgs) -> Self {
        Self { weights: Some(weights) }
    }

    /// The weights sub-scheme, required for compression.
    pub fn weights_args(&self) -> Result<&QuantizationArgs> {
        self.weights
            .as_ref()
            .ok_or_else(|| QLayerError::config("quantization scheme has no weights sub-scheme"))
    }
}

/// Lifecycle marker of a layer's weight representation.
///
/// Ordered; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationStatus {
    Uninitialized,
    Initialized,
    Calibration,
    Frozen,
    Compressed,
}

impl QuantizationStatus {
    /// Check that `next` does not revert the lifecycle.
    pub fn ensure_can_advance_to(self, next: QuantizationStatus) -> Result<()> {
        if next < self {
            return Err(QLayerError::state(format!(
                "quantization status cannot move from {self} back to {next}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for QuantizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuantizationStatus::Uninitialized => "uninitialized",
            QuantizationStatus::Initialized => "initialized",
            QuantizationStatus::Calibration => "calibration",
            QuantizationStatus::Frozen => "frozen",
            QuantizationStatus::Compressed => "compressed",
        };
        f.write_str(s)
    }
}

/// Logical dtype of a persisted parameter.
///
/// `I8` and `I32` have no native candle storage; they live in `U8` / `U32`
/// tensors holding the two's-complement bit patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamDType {
    I8,
    U8,
    I32,
    I64,
    F16,
    BF16,
    F32,
}

impl ParamDType {
    pub fn storage_dtype(self) -> DType {
        match self {
            ParamDType::I8 | ParamDType::U8 => DType::U8,
            ParamDType::I32 => DType::U32,
            ParamDType::I64 => DType::I64,
            ParamDType::F16 => DType::F16,
            ParamDType::BF16 => DType::BF16,
            ParamDType::F32 => DType::F32,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        self.storage_dtype().size_in_bytes()
    }

    pub fn is_float(self) -> bool {
        matches!(self, ParamDType::F16 | ParamDType::BF16 | ParamDType::F32)
    }
}

impl fmt::Display for ParamDType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamDType::I8 => "i8",
            ParamDType::U8 => "u8",
            ParamDType::I32 => "i32",
            ParamDType::I64 => "i64",
            ParamDType::F16 => "f16",
            ParamDType::BF16 => "bf16",
            ParamDType::F32 => "f32",
        };
        f.write_str(s)
    }
}

/// Floating dtype used for the materialized weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDType {
    #[default]
    F32,
    F16,
    BF16,
}

impl ComputeDType {
    pub fn to_dtype(self) -> DType {
        match self {
            ComputeDType::F32 => DType::F32,
            ComputeDType::F16 => DType::F16,
            ComputeDType::BF16 => DType::BF16,
        }
    }
}

impl FromStr for ComputeDType {
    type Err = QLayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(Self::F32),
            "f16" | "float16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::BF16),
            other => Err(QLayerError::config(format!("unknown compute dtype: {other}"))),
        }
    }
}

/// Device selection as written in configuration (`cpu`, `cuda:0`, `metal`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSpec {
    #[default]
    Cpu,
    Cuda(usize),
    Metal,
}

impl DeviceSpec {
    /// Open the candle device. Fails when the backend is not compiled in.
    pub fn to_candle(self) -> Result<Device> {
        match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal)
                .map_err(|e| QLayerError::config(format!("CUDA device {ordinal}: {e}"))),
            DeviceSpec::Metal => Device::new_metal(0)
                .map_err(|e| QLayerError::config(format!("Metal device: {e}"))),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            DeviceSpec::Metal => write!(f, "metal"),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = QLayerError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "cpu" => Ok(Self::Cpu),
            "metal" => Ok(Self::Metal),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            other => {
                if let Some(ordinal) = other.strip_prefix("cuda:") {
                    let ordinal = ordinal
                        .parse()
                        .map_err(|_| QLayerError::config(format!("invalid CUDA ordinal in {s}")))?;
                    Ok(Self::Cuda(ordinal))
                } else {
                    Err(QLayerError::config(format!("unknown device: {s}")))
                }
            }
        }
    }
}

impl TryFrom<String> for DeviceSpec {
    type Error = QLayerError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DeviceSpec> for String {
    fn from(value: DeviceSpec) -> Self {
        value.to_string()
    }
}
