//! Affine transform shared by the dense and compressed paths

use candle_core::Tensor;
use qlayer_common::{QLayerError, Result};

/// Compute `input · weightᵀ + bias`.
///
/// Input: `[.., in_features]` with 2 to 4 dimensions.
/// Output: `[.., out_features]`.
pub fn linear_forward(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let dims = input.dims();
    let (out_features, in_features) = weight.dims2()?;
    if !(2..=4).contains(&dims.len()) || dims[dims.len() - 1] != in_features {
        return Err(QLayerError::ShapeMismatch {
            input: dims.to_vec(),
            weight: vec![out_features, in_features],
        });
    }

    // Fold leading dimensions into one batch so a single matmul covers 3-D and 4-D inputs.
    let total_batch: usize = dims[..dims.len() - 1].iter().product();
    let input_2d = if dims.len() > 2 { input.reshape((total_batch, in_features))? } else { input.clone() };

    let output_2d = input_2d.matmul(&weight.t()?)?;
    let output_2d = match bias {
        Some(bias) => output_2d.broadcast_add(bias)?,
        None => output_2d,
    };

    if dims.len() > 2 {
        let mut out_shape = dims[..dims.len() - 1].to_vec();
        out_shape.push(out_features);
        Ok(output_2d.reshape(out_shape)?)
    } else {
        Ok(output_2d)
    }
}

#[cfg(all(test, feature = "cpu"))]
mod tests {
    use super::*;
    use candle_core::Device;

    fn weight() -> Tensor {
        Tensor::new(&[[1.0f32, 0.0, -1.0], [2.0, 1.0, 0.5]], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_2d_with_bias() {
        let input = Tensor::new(&[[1.0f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let bias = Tensor::new(&[0.5f32, -1.0], &Device::Cpu).unwrap();
        let out = linear_forward(&input, &weight(), Some(&bias)).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![-1.5, 4.5]]);
    }

    #[test]
    fn test_forward_3d_and_4d_keep_leading_dims() {
        let input = Tensor::ones((2, 5, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let out = linear_forward(&input, &weight(), None).unwrap();
        assert_eq!(out.dims(), &[2, 5, 2]);
        assert_eq!(out.get(1).unwrap().get(4).unwrap().to_vec1::<f32>().unwrap(), vec![0.0, 3.5]);

        let input = Tensor::ones((2, 2, 4, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert_eq!(linear_forward(&input, &weight(), None).unwrap().dims(), &[2, 2, 4, 2]);
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let input = Tensor::ones((1, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            linear_forward(&input, &weight(), None),
            Err(QLayerError::ShapeMismatch { .. })
        ));

        let input = Tensor::ones(3, candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            linear_forward(&input, &weight(), None),
            Err(QLayerError::ShapeMismatch { .. })
        ));
    }
}
