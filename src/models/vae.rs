//! # Variational Auto-Encoder (VAE) decoder.
//!
//! Auto-encoding Variational Bayes, Diederik P. Kingma, Max Welling, 2013.
//! https://arxiv.org/abs/1312.6114
//!
//! Only the decoding half is used at inference time, turning the final
//! latents into an RGB image.
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};
use tch::Tensor;

use super::session::{InferenceSession, NamedInput};
use super::unet::LATENT_CHANNELS;
use crate::error::{Error, Result};
use crate::tensor_ops::{expect_dims, to_vec};

pub const LATENT: &str = "latent";

/// The factor latents were multiplied by when the diffusion model was trained.
pub const SCALING_FACTOR: f64 = 0.18215;

/// An interleaved RGB8 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl GeneratedImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = 3 * width as usize * height as usize;
        if pixels.len() != expected {
            return Err(Error::shape(
                "pixel buffer",
                &[height as i64, width as i64, 3],
                &[pixels.len() as i64],
            ));
        }
        Ok(Self { width, height, pixels })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_rgb_image(self) -> Option<image::RgbImage> {
        image::RgbImage::from_raw(self.width, self.height, self.pixels)
    }

    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut png = vec![];
        PngEncoder::new(&mut png).write_image(
            &self.pixels,
            self.width,
            self.height,
            ColorType::Rgb8,
        )?;
        Ok(png)
    }

    /// Writes the PNG encoding of the image to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let png = self.to_png()?;
        std::fs::write(path, png)
            .map_err(|source| Error::Io { path: path.to_string_lossy().into_owned(), source })?;
        tracing::info!(path = %path.display(), "saved image");
        Ok(())
    }
}

/// Maps a channel value in `[-1, 1]` to a byte.
fn to_byte(v: f32) -> u8 {
    ((v + 1.) * 127.5).round().clamp(0., 255.) as u8
}

/// Converts channel-first `[3, height, width]` floats to interleaved RGB bytes.
fn to_pixels(data: &[f32], height: usize, width: usize) -> Vec<u8> {
    let plane = height * width;
    let mut pixels = Vec::with_capacity(3 * plane);
    for i in 0..plane {
        for c in 0..3 {
            pixels.push(to_byte(data[c * plane + i]));
        }
    }
    pixels
}

pub struct LatentDecoder {
    session: Box<dyn InferenceSession>,
}

impl LatentDecoder {
    pub fn new(session: Box<dyn InferenceSession>) -> Self {
        Self { session }
    }

    pub fn decode(&self, latents: &Tensor) -> Result<GeneratedImage> {
        let dims = latents.size();
        if dims.len() != 4 || dims[0] != 1 || dims[1] != LATENT_CHANNELS {
            return Err(Error::shape("latent", &[1, LATENT_CHANNELS, -1, -1], &dims));
        }
        let (height, width) = (8 * dims[2], 8 * dims[3]);
        let latents = latents / SCALING_FACTOR;
        let image = self.session.run(&[NamedInput::new(LATENT, &latents)])?;
        expect_dims("decoded image", &image, &[1, 3, height, width])?;
        let data = to_vec(&image)?;
        let pixels = to_pixels(&data, height as usize, width as usize);
        GeneratedImage::new(width as u32, height as u32, pixels)
    }
}
