//! # Denoising model
//!
//! Runs the conditional UNet once on a batch of two, the unconditional half
//! first, and combines both halves with classifier-free guidance.
//!
//! Classifier-Free Diffusion Guidance, J. Ho and T. Salimans, 2022.
//! https://arxiv.org/abs/2207.12598
use tch::Tensor;

use super::session::{InferenceSession, NamedInput};
use crate::error::{Error, Result};
use crate::tensor_ops::{concat_batch, duplicate, expect_dims, split_tensor};

pub const TEXT_EMBED: &str = "text_embed";
pub const LATENT: &str = "latent";
pub const TIMESTEP: &str = "timestep";

/// Number of channels of the latent space.
pub const LATENT_CHANNELS: i64 = 4;

/// `uncond + guidance_scale * (cond - uncond)`.
pub fn apply_guidance(uncond: &Tensor, cond: &Tensor, guidance_scale: f64) -> Tensor {
    uncond + (cond - uncond) * guidance_scale
}

pub struct DenoisingModel {
    session: Box<dyn InferenceSession>,
}

impl DenoisingModel {
    pub fn new(session: Box<dyn InferenceSession>) -> Self {
        Self { session }
    }

    /// Guided noise estimate for `latent`, the unconditional pass reusing the
    /// prompt embedding.
    pub fn predict(
        &self,
        embedding: &Tensor,
        latent: &Tensor,
        timestep: usize,
        guidance_scale: f64,
    ) -> Result<Tensor> {
        self.predict_with_uncond(None, embedding, latent, timestep, guidance_scale)
    }

    /// Guided noise estimate for `latent`, using `uncond` as the unconditional
    /// embedding when given.
    pub fn predict_with_uncond(
        &self,
        uncond: Option<&Tensor>,
        embedding: &Tensor,
        latent: &Tensor,
        timestep: usize,
        guidance_scale: f64,
    ) -> Result<Tensor> {
        let embed_dims = embedding.size();
        if embed_dims.len() != 3 || embed_dims[0] != 1 {
            let expected = [1, embed_dims.get(1).copied().unwrap_or(-1), -1];
            return Err(Error::shape("text embedding", &expected, &embed_dims));
        }
        let latent_dims = latent.size();
        if latent_dims.len() != 4 || latent_dims[0] != 1 || latent_dims[1] != LATENT_CHANNELS {
            return Err(Error::shape("latent", &[1, LATENT_CHANNELS, -1, -1], &latent_dims));
        }
        let (h, w) = (latent_dims[2], latent_dims[3]);
        let batched_dims = [2, LATENT_CHANNELS, h, w];

        let text_embed_dims = [2, embed_dims[1], embed_dims[2]];
        let text_embed = match uncond {
            None => duplicate(embedding, &text_embed_dims)?,
            Some(uncond) => {
                expect_dims("unconditional embedding", uncond, &embed_dims)?;
                concat_batch(uncond, embedding, &text_embed_dims)?
            }
        };
        let latent_input = duplicate(latent, &batched_dims)?;
        let timestep = Tensor::from(timestep as i64);

        let noise_pred = self.session.run(&[
            NamedInput::new(TEXT_EMBED, &text_embed),
            NamedInput::new(LATENT, &latent_input),
            NamedInput::new(TIMESTEP, &timestep),
        ])?;
        expect_dims("noise prediction", &noise_pred, &batched_dims)?;

        let (noise_pred_uncond, noise_pred_text) =
            split_tensor(&noise_pred, &[1, LATENT_CHANNELS, h, w])?;
        Ok(apply_guidance(&noise_pred_uncond, &noise_pred_text, guidance_scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_ops::{create_tensor, to_vec};
    use std::sync::{Arc, Mutex};

    #[test]
    fn guidance_endpoints() {
        let uncond = create_tensor(&[1., -2., 3., 0.5], &[1, 4, 1, 1]).unwrap();
        let cond = create_tensor(&[0., 4., -1., 2.5], &[1, 4, 1, 1]).unwrap();
        assert_eq!(to_vec(&apply_guidance(&uncond, &cond, 0.)).unwrap(), to_vec(&uncond).unwrap());
        assert_eq!(to_vec(&apply_guidance(&uncond, &cond, 1.)).unwrap(), to_vec(&cond).unwrap());
        let guided = to_vec(&apply_guidance(&uncond, &cond, 7.5)).unwrap();
        assert!((guided[1] - (-2. + 7.5 * 6.)).abs() < 1e-5);
    }

    type Seen = Arc<Mutex<Vec<(Vec<i64>, Vec<f32>, Vec<i64>, i64)>>>;

    // Returns the unconditional half as the latent and the conditional half
    // as the latent plus one, recording the input batches.
    struct EchoUnet {
        seen: Seen,
    }

    impl InferenceSession for EchoUnet {
        fn run(&self, inputs: &[NamedInput<'_>]) -> Result<Tensor> {
            let get = |name: &str| inputs.iter().find(|i| i.name == name).map(|i| i.value).unwrap();
            let latent = get(LATENT);
            let embed = get(TEXT_EMBED);
            let timestep = get(TIMESTEP);
            let t = i64::try_from(timestep).unwrap();
            let entry = (embed.size(), to_vec(embed).unwrap(), timestep.size(), t);
            self.seen.lock().unwrap().push(entry);
            let (uncond, cond) = split_tensor(latent, &[1, 4, 2, 2]).unwrap();
            Ok(Tensor::cat(&[uncond, cond + 1.], 0))
        }
    }

    #[test]
    fn predict_batches_and_guides() {
        let seen = Seen::default();
        let unet = DenoisingModel::new(Box::new(EchoUnet { seen: seen.clone() }));
        let latent = Tensor::zeros([1, 4, 2, 2], tch::kind::FLOAT_CPU);
        let embedding = create_tensor(&[1., 2., 3., 4., 5., 6.], &[1, 2, 3]).unwrap();
        let negative = create_tensor(&[0.; 6], &[1, 2, 3]).unwrap();

        let guided = unet.predict(&embedding, &latent, 981, 3.).unwrap();
        assert_eq!(guided.size(), vec![1, 4, 2, 2]);
        assert!(to_vec(&guided).unwrap().iter().all(|&v| (v - 3.).abs() < 1e-6));

        unet.predict_with_uncond(Some(&negative), &embedding, &latent, 1, 1.).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, vec![2, 2, 3]);
        assert_eq!(seen[0].1, vec![1., 2., 3., 4., 5., 6., 1., 2., 3., 4., 5., 6.]);
        // The timestep is a scalar.
        assert_eq!(seen[0].2, Vec::<i64>::new());
        assert_eq!(seen[0].3, 981);
        assert_eq!(seen[1].3, 1);
        assert_eq!(seen[1].1, vec![0., 0., 0., 0., 0., 0., 1., 2., 3., 4., 5., 6.]);
    }

    struct FixedOutput(Vec<i64>);

    impl InferenceSession for FixedOutput {
        fn run(&self, _inputs: &[NamedInput<'_>]) -> Result<Tensor> {
            Ok(Tensor::zeros(self.0.as_slice(), tch::kind::FLOAT_CPU))
        }
    }

    #[test]
    fn shape_validation() {
        let latent = Tensor::zeros([1, 4, 2, 2], tch::kind::FLOAT_CPU);
        let embedding = Tensor::zeros([1, 2, 3], tch::kind::FLOAT_CPU);

        let unet = DenoisingModel::new(Box::new(FixedOutput(vec![1, 4, 2, 2])));
        let err = unet.predict(&embedding, &latent, 1, 7.5).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));

        let unet = DenoisingModel::new(Box::new(FixedOutput(vec![2, 4, 2, 2])));
        assert!(unet.predict(&embedding, &latent, 1, 7.5).is_ok());
        let bad_latent = Tensor::zeros([1, 3, 2, 2], tch::kind::FLOAT_CPU);
        assert!(unet.predict(&embedding, &bad_latent, 1, 7.5).is_err());
        let bad_embedding = Tensor::zeros([2, 2, 3], tch::kind::FLOAT_CPU);
        assert!(unet.predict(&bad_embedding, &latent, 1, 7.5).is_err());
        let bad_negative = Tensor::zeros([1, 3, 3], tch::kind::FLOAT_CPU);
        assert!(unet.predict_with_uncond(Some(&bad_negative), &embedding, &latent, 1, 7.5).is_err());
    }
}
