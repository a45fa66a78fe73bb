//! Configuration types and utilities

use crate::{
    ComputeDType, DeviceSpec, QLayerError, QuantizationArgs, QuantizationScheme,
    QuantizationStrategy, Result,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Default compression format identifier.
pub const DEFAULT_FORMAT: &str = "int-quantized";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QLayerConfig {
    pub compression: CompressionConfig,
    pub runtime: RuntimeConfig,
}

/// Which format to compress into and with which scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub format: String,
    pub scheme: QuantizationScheme,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_FORMAT.to_string(),
            scheme: QuantizationScheme::new(QuantizationArgs::int8_channel()),
        }
    }
}

/// Where and in which precision the materialized weight lives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device: DeviceSpec,
    /// `None` keeps the dtype of the original dense weight.
    pub compute_dtype: Option<ComputeDType>,
}

impl QLayerConfig {
    pub fn builder() -> QLayerConfigBuilder {
        QLayerConfigBuilder::default()
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| QLayerError::ConfigParse(format!("{}: {e}", path.display())))?,
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| QLayerError::ConfigParse(format!("{}: {e}", path.display())))?,
            other => {
                return Err(QLayerError::ConfigParse(format!(
                    "unsupported config extension {other:?} for {}",
                    path.display()
                )))
            }
        };
        debug!(path = %path.display(), format = %config.compression.format, "loaded config file");
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `QLAYER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(format) = std::env::var("QLAYER_FORMAT") {
            self.compression.format = format;
        }

        let weight_vars = [
            "QLAYER_NUM_BITS",
            "QLAYER_STRATEGY",
            "QLAYER_GROUP_SIZE",
            "QLAYER_SYMMETRIC",
        ];
        if weight_vars.iter().any(|v| std::env::var(v).is_ok()) {
            let args = self.compression.scheme.weights.get_or_insert_with(QuantizationArgs::default);

            if let Ok(bits) = std::env::var("QLAYER_NUM_BITS") {
                args.num_bits = bits
                    .parse()
                    .map_err(|_| QLayerError::ConfigParse(format!("invalid QLAYER_NUM_BITS: {bits}")))?;
            }
            if let Ok(strategy) = std::env::var("QLAYER_STRATEGY") {
                args.strategy = strategy.parse::<QuantizationStrategy>()?;
                if args.strategy != QuantizationStrategy::Group {
                    args.group_size = None;
                }
            }
            if let Ok(group) = std::env::var("QLAYER_GROUP_SIZE") {
                args.group_size = Some(group.parse().map_err(|_| {
                    QLayerError::ConfigParse(format!("invalid QLAYER_GROUP_SIZE: {group}"))
                })?);
            }
            if let Ok(symmetric) = std::env::var("QLAYER_SYMMETRIC") {
                args.symmetric = parse_bool(&symmetric).ok_or_else(|| {
                    QLayerError::ConfigParse(format!("invalid QLAYER_SYMMETRIC: {symmetric}"))
                })?;
            }
        }

        if let Ok(device) = std::env::var("QLAYER_DEVICE") {
            self.runtime.device = device.parse()?;
        }
        if let Ok(dtype) = std::env::var("QLAYER_COMPUTE_DTYPE") {
            self.runtime.compute_dtype = Some(dtype.parse()?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.compression.format.trim().is_empty() {
            return Err(QLayerError::config("compression format must not be empty"));
        }
        self.compression.scheme.weights_args()?.validate()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Builder over [`QLayerConfig`]; `build` validates.
#[derive(Debug, Default)]
pub struct QLayerConfigBuilder {
    config: QLayerConfig,
}

impl QLayerConfigBuilder {
    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.config.compression.format = format.into();
        self
    }

    pub fn weights(mut self, args: QuantizationArgs) -> Self {
        self.config.compression.scheme.weights = Some(args);
        self
    }

    pub fn num_bits(mut self, num_bits: u8) -> Self {
        self.weights_mut().num_bits = num_bits;
        self
    }

    pub fn symmetric(mut self, symmetric: bool) -> Self {
        self.weights_mut().symmetric = symmetric;
        self
    }

    pub fn group_size(mut self, group_size: usize) -> Self {
        let args = self.weights_mut();
        args.strategy = QuantizationStrategy::Group;
        args.group_size = Some(group_size);
        self
    }

    pub fn device(mut self, device: DeviceSpec) -> Self {
        self.config.runtime.device = device;
        self
    }

    pub fn compute_dtype(mut self, dtype: ComputeDType) -> Self {
        self.config.runtime.compute_dtype = Some(dtype);
        self
    }

    fn weights_mut(&mut self) -> &mut QuantizationArgs {
        self.config.compression.scheme.weights.get_or_insert_with(QuantizationArgs::default)
    }

    pub fn build(self) -> Result<QLayerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Layered loading: defaults, then an optional file, then the environment.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load_with_precedence(path: Option<&Path>) -> Result<QLayerConfig> {
        let mut config = match path {
            Some(path) => QLayerConfig::from_file(path)?,
            None => QLayerConfig::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}
