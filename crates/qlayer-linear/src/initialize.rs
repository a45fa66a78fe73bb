//! Scheme initialization and min-max calibration of dense layers

use crate::dense::DenseLinear;
use qlayer_common::{
    ParameterStore, QLayerError, QuantizationArgs, QuantizationScheme, QuantizationStatus, Result,
};
use qlayer_quantization::{CompressionFormat, MinMaxObserver, QParams, qparam_descriptors};
use tracing::{debug, info};

impl DenseLinear {
    /// Attach the scale / zero-point parameters `scheme` requires.
    ///
    /// Existing parameters with the expected name, shape and dtype are kept,
    /// so calibrated values survive re-initialization. Parameters the scheme
    /// no longer needs are dropped. A zero-point is attached for symmetric
    /// schemes only when `force_zero_point` is set.
    pub fn initialize_for_quantization(
        &mut self,
        scheme: &QuantizationScheme,
        force_zero_point: bool,
    ) -> Result<()> {
        let args = scheme.weights_args()?;
        let descriptors = qparam_descriptors(self.weight.dims(), args, force_zero_point)?;

        let mut params = ParameterStore::new();
        let mut reused = 0usize;
        for (name, descriptor) in &descriptors {
            match self.quantization_params.get(name) {
                Some(existing) if existing.descriptor() == *descriptor => {
                    params.register(name.as_str(), existing.clone());
                    reused += 1;
                }
                _ => {
                    params.register(name.as_str(), descriptor.allocate(name, self.weight.device())?);
                }
            }
        }

        self.quantization_params = params;
        self.scheme = Some(scheme.clone());
        self.status = self.status.max(QuantizationStatus::Initialized);
        debug!(
            params = descriptors.len(),
            reused,
            force_zero_point,
            status = %self.status,
            "initialized layer for quantization"
        );
        Ok(())
    }

    /// Compute scale / zero-point from the current weight with a min-max observer.
    pub fn calibrate(&mut self) -> Result<QParams> {
        if self.status < QuantizationStatus::Initialized {
            return Err(QLayerError::state("calibrate invoked before initialization"));
        }
        self.status.ensure_can_advance_to(QuantizationStatus::Calibration)?;

        let args = self.weights_args()?.clone();
        let qparams =
            MinMaxObserver::new().observe_into(&self.weight, &args, &mut self.quantization_params)?;
        self.status = QuantizationStatus::Calibration;
        info!(
            out_features = self.out_features,
            in_features = self.in_features,
            groups = qparams.scales.len(),
            "calibrated layer"
        );
        Ok(qparams)
    }

    /// Stop updating the calibrated parameters.
    pub fn freeze(&mut self) -> Result<()> {
        match self.status {
            QuantizationStatus::Calibration => {
                self.status = QuantizationStatus::Frozen;
                Ok(())
            }
            QuantizationStatus::Frozen => Ok(()),
            other => Err(QLayerError::state(format!("cannot freeze a layer in status {other}"))),
        }
    }

    /// Encode the current weight with `format`, producing the state a
    /// compressed layer of the same shape loads.
    ///
    /// Calibrated parameters are used as-is; otherwise the weight is observed
    /// on the fly.
    pub fn export_compressed(&self, format: &dyn CompressionFormat) -> Result<ParameterStore> {
        let args = self.weights_args()?;
        if self.status >= QuantizationStatus::Calibration {
            format.compress(&self.weight, &self.quantization_params, args)
        } else {
            qlayer_quantization::compress_weight(format, &self.weight, args)
        }
    }

    fn weights_args(&self) -> Result<&QuantizationArgs> {
        self.scheme
            .as_ref()
            .ok_or_else(|| QLayerError::state("layer has no quantization scheme attached"))?
            .weights_args()
    }
}
