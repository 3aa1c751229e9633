//! # VAE facade
//!
//! Wraps an external variational auto-encoder network for image to latent
//! encoding and decoding. The network itself (convolutions, checkpoint
//! loading, internal device handling) sits behind [`VaeBackend`]; this layer
//! owns the pixel conversions, the inpainting mask preparation and the shape
//! contracts around the encode/decode calls.
use crate::latent::LatentImage;
use crate::utils;
use anyhow::Result;
use image::{DynamicImage, GenericImageView, RgbImage};
use log::debug;
use std::path::Path;
use tch::{Device, Kind, Tensor};

#[derive(Debug, thiserror::Error)]
pub enum VaeError {
    /// Encode/decode need the model placed on an accelerator device.
    #[error("operation requires the VAE to be placed on an accelerator device")]
    AcceleratorRequired,
    #[error("image size {image:?} does not match mask size {mask:?}")]
    SizeMismatch { image: (i64, i64), mask: (i64, i64) },
    /// Multi-image batch decode is unsupported.
    #[error("expected a single decoded image, got a batch of {got}")]
    UnexpectedBatchSize { got: i64 },
}

/// The external VAE network.
///
/// `encode` consumes a `(1, height, width, 3)` pixel tensor in `[0, 1]` and
/// returns a `(1, 4, height/8, width/8)` latent; `decode` is the inverse and
/// returns a channel-last `(batch, height, width, 3)` pixel tensor in
/// `[0, 1]`.
pub trait VaeBackend {
    fn from_checkpoint(path: &Path) -> Result<Self>
    where
        Self: Sized;

    fn encode(&self, pixels: &Tensor) -> Tensor;

    fn decode(&self, samples: &Tensor) -> Tensor;

    /// Moves the underlying network to `device`.
    fn to_device(&mut self, device: Device);
}

pub struct VaeModel<V> {
    backend: V,
    device: Device,
}

impl<V: VaeBackend> VaeModel<V> {
    pub fn new(backend: V, device: Device) -> Self {
        Self { backend, device }
    }

    /// Loads the VAE network from a checkpoint file. The model starts on the
    /// host; move it with [`with_device`](Self::with_device) before encoding.
    pub fn from_checkpoint<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(V::from_checkpoint(path.as_ref())?, Device::Cpu))
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns the model moved to `device`; a no-op when it already lives
    /// there.
    pub fn with_device(mut self, device: Device) -> Self {
        if device != self.device {
            self.backend.to_device(device);
            self.device = device;
        }
        self
    }

    fn ensure_accelerator(&self) -> Result<(), VaeError> {
        match self.device {
            Device::Cpu => Err(VaeError::AcceleratorRequired),
            _ => Ok(()),
        }
    }

    /// Encodes an image into latent space.
    pub fn encode(&self, image: &DynamicImage) -> Result<LatentImage> {
        self.ensure_accelerator()?;
        let pixels = utils::image_to_rgb_tensor(image);
        let samples = self.backend.encode(&pixels);
        Ok(LatentImage::new(samples, None).with_device(self.device))
    }

    /// Encodes an image for inpainting. Pixels under the mask (minus a ~3
    /// pixel feather band) have their color contribution neutralized before
    /// encoding, and the returned latent carries the original pixel-space
    /// mask as its noise mask. The image and mask must have the same pixel
    /// size, with both dimensions multiples of 64.
    pub fn masked_encode(&self, image: &DynamicImage, mask: &DynamicImage) -> Result<LatentImage> {
        let image_size = image.dimensions();
        let mask_size = mask.dimensions();
        if image_size != mask_size {
            return Err(VaeError::SizeMismatch {
                image: (image_size.0 as i64, image_size.1 as i64),
                mask: (mask_size.0 as i64, mask_size.1 as i64),
            }
            .into());
        }
        utils::check_divisible_by_64(image_size.0 as i64)?;
        utils::check_divisible_by_64(image_size.1 as i64)?;
        self.ensure_accelerator()?;

        let pixels = utils::image_to_rgb_tensor(image);
        let mask_t = utils::image_to_greyscale_tensor(mask);
        let erosion = erode_inverse_mask(&mask_t);
        let pixels = neutralize_unmasked(&pixels, &erosion);
        let samples = self.backend.encode(&pixels);
        let mask_t = mask_t.to(samples.device());
        Ok(LatentImage::new(samples, Some(mask_t)).with_device(self.device))
    }

    /// Decodes a latent back into an 8-bit RGB image. Only single-image
    /// batches are supported.
    pub fn decode(&self, latent: &LatentImage) -> Result<RgbImage> {
        self.ensure_accelerator()?;
        let decoded = self.backend.decode(&latent.to_state().samples);
        let batch = decoded.size()[0];
        if batch != 1 {
            return Err(VaeError::UnexpectedBatchSize { got: batch }.into());
        }
        let (_, height, width, channels) = decoded.size4().unwrap();
        debug!("decoded {width}x{height} image with {channels} channels");
        let bytes = (decoded.view([height, width, channels]).clamp(0., 1.) * 255.)
            .round()
            .to_kind(Kind::Uint8)
            .to(Device::Cpu)
            .flatten(0, -1);
        let bytes = Vec::<u8>::try_from(bytes)?;
        RgbImage::from_raw(width as u32, height as u32, bytes)
            .ok_or_else(|| anyhow::anyhow!("decoded tensor is not a {width}x{height} rgb image"))
    }
}

// Expands the unmasked region by ~3 pixels: the inverse of the rounded mask
// is convolved with a 6x6 all-ones kernel (padding 3) and clamped to [0, 1].
// The convolution yields one extra row and column, cropped back off.
fn erode_inverse_mask(mask: &Tensor) -> Tensor {
    let (height, width) = mask.size2().unwrap();
    let kernel = Tensor::ones([1, 1, 6, 6], (Kind::Float, mask.device()));
    let inverse = (1i64 - mask.round()).view([1, 1, height, width]);
    inverse
        .conv2d(&kernel, None::<Tensor>, [1], [3], [1], 1)
        .clamp(0., 1.)
        .narrow(2, 0, height)
        .narrow(3, 0, width)
        .view([height, width])
}

// Recenters each RGB channel around zero, zeroes it where the rounded
// erosion map is zero and shifts it back, removing the unmasked background's
// color contribution from the encode.
fn neutralize_unmasked(pixels: &Tensor, erosion: &Tensor) -> Tensor {
    let pixels = pixels.copy();
    let rounded = erosion.round();
    for channel in 0..3 {
        let mut view = pixels.select(3, channel);
        let updated = (&view - 0.5) * &rounded + 0.5;
        view.copy_(&updated);
    }
    pixels
}
