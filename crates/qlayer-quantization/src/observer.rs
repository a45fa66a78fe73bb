//! Min-max observer and conversions between [`QParams`] and stored tensors

use crate::utils::{QParams, calculate_qparams, extract_f32_data};
use crate::{WEIGHT_SCALE, WEIGHT_ZERO_POINT};
use candle_core::{Device, Tensor};
use qlayer_common::{
    ParamDType, Parameter, ParameterDescriptor, ParameterDescriptors, ParameterStore,
    QuantizationArgs, Result,
};
use tracing::debug;

/// Observes a dense weight and derives scale / zero-point from its range.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinMaxObserver;

impl MinMaxObserver {
    pub fn new() -> Self {
        Self
    }

    /// Compute qparams for `weight` under `args`.
    pub fn observe(&self, weight: &Tensor, args: &QuantizationArgs) -> Result<QParams> {
        let data = extract_f32_data(weight)?;
        let qparams = calculate_qparams(&data, weight.dims(), args)?;
        debug!(
            shape = ?weight.dims(),
            strategy = %args.strategy,
            groups = qparams.scales.len(),
            "observed weight range"
        );
        Ok(qparams)
    }

    /// Observe `weight` and write the result into `store`, reusing existing slots.
    pub fn observe_into(
        &self,
        weight: &Tensor,
        args: &QuantizationArgs,
        store: &mut ParameterStore,
    ) -> Result<QParams> {
        let qparams = self.observe(weight, args)?;
        let computed = qparams_to_store(&qparams, args, weight.dims(), weight.device())?;
        for (name, param) in computed.iter() {
            if store.contains(name) {
                store.load_parameter(name, param)?;
            } else {
                store.register(name, param.clone());
            }
        }
        Ok(qparams)
    }
}

/// Descriptors of the scale (and, if used, zero-point) parameters.
pub fn qparam_descriptors(
    weight_shape: &[usize],
    args: &QuantizationArgs,
    force_zero_point: bool,
) -> Result<ParameterDescriptors> {
    let shape = args.qparam_shape(weight_shape)?;
    let mut descriptors = ParameterDescriptors::new();
    descriptors.insert(WEIGHT_SCALE.to_string(), ParameterDescriptor::new(shape.clone(), ParamDType::F32));
    if args.uses_zero_point() || force_zero_point {
        descriptors.insert(WEIGHT_ZERO_POINT.to_string(), ParameterDescriptor::new(shape, ParamDType::I8));
    }
    Ok(descriptors)
}

/// Read scale / zero-point values out of a parameter store.
///
/// A zero-point slot present on a symmetric scheme is ignored.
pub fn qparams_from_store(store: &ParameterStore, args: &QuantizationArgs) -> Result<QParams> {
    let scales = store.require(WEIGHT_SCALE)?.to_f32_vec()?;
    let zero_points = if args.uses_zero_point() {
        Some(store.require(WEIGHT_ZERO_POINT)?.to_i8_vec()?)
    } else {
        None
    };
    Ok(QParams { scales, zero_points })
}

/// Materialize qparams as stored parameters on `device`.
pub fn qparams_to_store(
    qparams: &QParams,
    args: &QuantizationArgs,
    weight_shape: &[usize],
    device: &Device,
) -> Result<ParameterStore> {
    let shape = args.qparam_shape(weight_shape)?;
    let mut store = ParameterStore::new();
    store.register(WEIGHT_SCALE, Parameter::from_f32(qparams.scales.clone(), &shape, device)?);
    if let Some(zero_points) = &qparams.zero_points {
        store.register(WEIGHT_ZERO_POINT, Parameter::from_i8(zero_points, &shape, device)?);
    }
    Ok(store)
}

#[cfg(all(test, feature = "cpu"))]
mod tests {
    use super::*;

    #[test]
    fn test_observe_channel() {
        let weight = Tensor::new(&[[1.0f32, -2.0], [0.5, 0.25]], &Device::Cpu).unwrap();
        let qparams = MinMaxObserver::new().observe(&weight, &QuantizationArgs::int8_channel()).unwrap();
        assert_eq!(qparams.scales.len(), 2);
        assert!((qparams.scales[0] - 2.0 / 127.5).abs() < 1e-7);
        assert!((qparams.scales[1] - 0.5 / 127.5).abs() < 1e-7);
    }

    #[test]
    fn test_descriptors_skip_zero_point_when_symmetric() {
        let args = QuantizationArgs::int8_channel();
        let d = qparam_descriptors(&[4, 4], &args, false).unwrap();
        assert_eq!(d.len(), 1);
        assert_eq!(d[WEIGHT_SCALE], ParameterDescriptor::new([4], ParamDType::F32));

        let forced = qparam_descriptors(&[4, 4], &args, true).unwrap();
        assert_eq!(forced[WEIGHT_ZERO_POINT].dtype, ParamDType::I8);

        let asym = qparam_descriptors(&[4, 4], &args.with_symmetric(false), false).unwrap();
        assert!(asym.contains_key(WEIGHT_ZERO_POINT));
    }

    #[test]
    fn test_store_round_trip() {
        let args = QuantizationArgs::int4_group(2, false);
        let qparams = QParams { scales: vec![0.5, 0.25, 1.0, 2.0], zero_points: Some(vec![-3, 0, 1, 7]) };
        let store = qparams_to_store(&qparams, &args, &[2, 4], &Device::Cpu).unwrap();
        assert_eq!(store.require(WEIGHT_SCALE).unwrap().shape(), &[2, 2]);
        assert_eq!(qparams_from_store(&store, &args).unwrap(), qparams);
    }

    #[test]
    fn test_observe_into_overwrites_existing_slots() {
        let args = QuantizationArgs::int8_channel();
        let mut store = ParameterStore::new();
        for (name, desc) in qparam_descriptors(&[2, 2], &args, false).unwrap() {
            store.register(name.clone(), desc.allocate(&name, &Device::Cpu).unwrap());
        }
        let weight = Tensor::new(&[[1.0f32, 0.0], [0.0, -4.0]], &Device::Cpu).unwrap();
        MinMaxObserver::new().observe_into(&weight, &args, &mut store).unwrap();
        let scales = store.require(WEIGHT_SCALE).unwrap().to_f32_vec().unwrap();
        assert!((scales[1] - 4.0 / 127.5).abs() < 1e-7);
    }
}
