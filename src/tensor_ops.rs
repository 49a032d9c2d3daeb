//! # Shape-checked tensor helpers
//!
//! Building tensors from raw buffers, merging the unconditional and
//! conditional passes into a single batch and splitting them back. Every
//! helper checks that element counts agree with the requested dimensions
//! rather than letting a malformed tensor reach a model session.
use rand::Rng;
use tch::{Kind, Tensor};

use crate::error::{Error, Result};

fn numel(dims: &[i64]) -> Result<usize> {
    if dims.is_empty() || dims.iter().any(|&d| d <= 0) {
        return Err(Error::config(format!("invalid tensor dimensions {dims:?}")));
    }
    Ok(dims.iter().product::<i64>() as usize)
}

pub fn dims_of(tensor: &Tensor) -> Vec<i64> {
    tensor.size()
}

/// Fails with a shape mismatch unless `tensor` has exactly the `expected` dimensions.
pub fn expect_dims(context: &str, tensor: &Tensor, expected: &[i64]) -> Result<()> {
    let actual = tensor.size();
    if actual != expected {
        return Err(Error::shape(context, expected, &actual));
    }
    Ok(())
}

/// Creates a float tensor with dimensions `dims` from a flat buffer.
pub fn create_tensor(data: &[f32], dims: &[i64]) -> Result<Tensor> {
    let expected = numel(dims)?;
    if data.len() != expected {
        return Err(Error::shape("tensor data", dims, &[data.len() as i64]));
    }
    Ok(Tensor::from_slice(data).reshape(dims))
}

/// Creates an int64 tensor, used for token ids and timesteps.
pub fn create_int_tensor(data: &[i64], dims: &[i64]) -> Result<Tensor> {
    let expected = numel(dims)?;
    if data.len() != expected {
        return Err(Error::shape("tensor data", dims, &[data.len() as i64]));
    }
    Ok(Tensor::from_slice(data).reshape(dims))
}

/// Builds a batch-of-2 tensor by concatenating the data of `tensor` with itself.
pub fn duplicate(tensor: &Tensor, dims: &[i64]) -> Result<Tensor> {
    concat_batch(tensor, tensor, dims)
}

/// Concatenates `first` then `second` along the batch axis, the result having `dims`.
pub fn concat_batch(first: &Tensor, second: &Tensor, dims: &[i64]) -> Result<Tensor> {
    let expected = numel(dims)?;
    if first.size() != second.size() {
        return Err(Error::shape("batch halves", &first.size(), &second.size()));
    }
    let got = first.numel() + second.numel();
    if got != expected {
        return Err(Error::shape("batched tensor", dims, &[got as i64]));
    }
    let first = first.flatten(0, -1);
    let second = second.flatten(0, -1);
    Ok(Tensor::cat(&[first, second], 0).reshape(dims))
}

/// Splits a batch-of-2 tensor along the batch axis, each half having `half_dims`.
pub fn split_tensor(tensor: &Tensor, half_dims: &[i64]) -> Result<(Tensor, Tensor)> {
    let half = numel(half_dims)?;
    if tensor.numel() != 2 * half {
        let doubled: Vec<i64> =
            half_dims.iter().enumerate().map(|(i, &d)| if i == 0 { 2 * d } else { d }).collect();
        return Err(Error::shape("split input", &doubled, &tensor.size()));
    }
    let flat = tensor.flatten(0, -1);
    let first = flat.narrow(0, 0, half as i64).reshape(half_dims);
    let second = flat.narrow(0, half as i64, half as i64).reshape(half_dims);
    Ok((first, second))
}

/// Elementwise sum of equally sized tensors.
pub fn sum_tensors(tensors: &[Tensor], dims: &[i64]) -> Result<Tensor> {
    let expected = numel(dims)?;
    let (first, rest) = match tensors.split_first() {
        None => return Err(Error::config("no tensors provided for summation")),
        Some(v) => v,
    };
    if first.numel() != expected {
        return Err(Error::shape("summed tensor", dims, &[first.numel() as i64]));
    }
    let mut sum = first.flatten(0, -1).to_kind(Kind::Float);
    for tensor in rest {
        if tensor.numel() != expected {
            return Err(Error::shape("summed tensor", dims, &[tensor.numel() as i64]));
        }
        sum += tensor.flatten(0, -1).to_kind(Kind::Float);
    }
    Ok(sum.reshape(dims))
}

/// Draws standard normal values with the Box–Muller transform and scales them.
pub fn sample_gaussian<R: Rng + ?Sized>(rng: &mut R, dims: &[i64], scale: f64) -> Result<Tensor> {
    let len = numel(dims)?;
    let mut data = Vec::with_capacity(len + 1);
    while data.len() < len {
        // Shift to (0, 1] so that the log stays finite.
        let u1 = 1. - rng.gen::<f64>();
        let u2 = rng.gen::<f64>();
        let radius = (-2. * u1.ln()).sqrt();
        let theta = 2. * std::f64::consts::PI * u2;
        data.push((radius * theta.cos() * scale) as f32);
        data.push((radius * theta.sin() * scale) as f32);
    }
    data.truncate(len);
    create_tensor(&data, dims)
}

/// Copies a float tensor into a flat host buffer.
pub(crate) fn to_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    let flat = tensor.to_device(tch::Device::Cpu).to_kind(Kind::Float).flatten(0, -1);
    Ok(Vec::<f32>::try_from(&flat)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn create_checks_element_count() {
        let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let t = create_tensor(&data, &[2, 3, 4]).unwrap();
        assert_eq!(t.size(), vec![2, 3, 4]);
        assert_eq!(to_vec(&t).unwrap(), data);

        for dims in [[2, 3, 5], [1, 1, 1], [4, 3, 1]] {
            let err = create_tensor(&data, &dims).unwrap_err();
            assert!(matches!(err, Error::ShapeMismatch { .. }), "{dims:?}");
        }
        assert!(create_tensor(&data, &[24, 0]).is_err());
        assert!(create_tensor(&[], &[]).is_err());
    }

    #[test]
    fn duplicate_then_split() {
        let data: Vec<f32> = (0..32).map(|v| v as f32 * 0.5 - 3.).collect();
        let t = create_tensor(&data, &[1, 2, 4, 4]).unwrap();
        let batched = duplicate(&t, &[2, 2, 4, 4]).unwrap();
        assert_eq!(batched.size(), vec![2, 2, 4, 4]);

        let (a, b) = split_tensor(&batched, &[1, 2, 4, 4]).unwrap();
        assert_eq!(to_vec(&a).unwrap(), data);
        assert_eq!(to_vec(&b).unwrap(), data);
    }

    #[test]
    fn duplicate_rejects_bad_dims() {
        let t = create_tensor(&[1., 2., 3., 4.], &[1, 4]).unwrap();
        assert!(duplicate(&t, &[1, 4]).is_err());
        assert!(duplicate(&t, &[2, 4]).is_ok());
        assert!(split_tensor(&t, &[1, 4]).is_err());
    }

    #[test]
    fn concat_keeps_order() {
        let a = create_tensor(&[1., 2.], &[1, 2]).unwrap();
        let b = create_tensor(&[3., 4.], &[1, 2]).unwrap();
        let ab = concat_batch(&a, &b, &[2, 2]).unwrap();
        assert_eq!(to_vec(&ab).unwrap(), vec![1., 2., 3., 4.]);
        let (first, second) = split_tensor(&ab, &[1, 2]).unwrap();
        assert_eq!(to_vec(&first).unwrap(), vec![1., 2.]);
        assert_eq!(to_vec(&second).unwrap(), vec![3., 4.]);
    }

    #[test]
    fn sum() {
        let a = create_tensor(&[1., 2., 3.], &[3]).unwrap();
        let b = create_tensor(&[10., 20., 30.], &[3]).unwrap();
        let c = create_tensor(&[0.5, 0.5, 0.5], &[1, 3]).unwrap();
        let s = sum_tensors(&[a.shallow_clone(), b, c], &[1, 3]).unwrap();
        assert_eq!(s.size(), vec![1, 3]);
        assert_eq!(to_vec(&s).unwrap(), vec![11.5, 22.5, 33.5]);

        assert!(sum_tensors(&[], &[3]).is_err());
        let short = create_tensor(&[1., 2.], &[2]).unwrap();
        assert!(sum_tensors(&[a, short], &[3]).is_err());
    }

    #[test]
    fn gaussian_is_seeded_and_roughly_normal() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let t = sample_gaussian(&mut rng, &[1, 4, 32, 33], 1.).unwrap();
        assert_eq!(t.size(), vec![1, 4, 32, 33]);
        let values = to_vec(&t).unwrap();
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 0.1, "mean {mean}");
        assert!((var - 1.).abs() < 0.1, "var {var}");

        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let again = sample_gaussian(&mut rng, &[1, 4, 32, 33], 1.).unwrap();
        assert_eq!(to_vec(&again).unwrap(), values);

        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let scaled = sample_gaussian(&mut rng, &[1, 4, 32, 33], 2.).unwrap();
        let scaled = to_vec(&scaled).unwrap();
        assert!((scaled[7] - 2. * values[7]).abs() < 1e-5);
    }
}
