//! # Latent image values
//!
//! A latent image is a `(batch, channel, height, width)` tensor produced by a
//! VAE encoder, optionally paired with a pixel-space noise mask controlling
//! how strongly denoising is applied per pixel. All operations produce new
//! values; device placement is an explicit transform rather than hidden
//! mutable state.
use crate::utils::{self, CropMethod, UpscaleMethod};
use anyhow::Result;
use image::{DynamicImage, GenericImageView};
use tch::{Device, Kind, Tensor};

/// Violations of the latent layer's dimension contracts.
#[derive(Debug, thiserror::Error)]
pub enum LatentError {
    #[error("dimension {value} is not a multiple of {multiple}")]
    NotMultipleOf { value: i64, multiple: i64 },
}

/// The wire form handed to the sampler: the sample tensor plus the optional
/// pixel-space noise mask.
#[derive(Debug)]
pub struct LatentState {
    pub samples: Tensor,
    pub noise_mask: Option<Tensor>,
}

#[derive(Debug)]
pub struct LatentImage {
    samples: Tensor,
    noise_mask: Option<Tensor>,
    device: Device,
}

impl LatentImage {
    pub fn new(samples: Tensor, noise_mask: Option<Tensor>) -> Self {
        let device = samples.device();
        Self { samples, noise_mask, device }
    }

    /// A zero-filled latent for a `width` x `height` pixel image. Both
    /// dimensions must be multiples of 8, the model's spatial downsampling
    /// factor.
    pub fn empty(width: i64, height: i64) -> Result<Self> {
        let width = utils::check_divisible_by_8(width)?;
        let height = utils::check_divisible_by_8(height)?;
        let samples = Tensor::zeros([1, 4, height, width], (Kind::Float, Device::Cpu));
        Ok(Self::new(samples, None))
    }

    /// The latent-space `(width, height)` of the sample tensor.
    pub fn size(&self) -> (i64, i64) {
        let (_, _, height, width) = self.samples.size4().unwrap();
        (width, height)
    }

    /// The pixel-space `(width, height)` this latent decodes to. Pixel-space
    /// masks are checked against this, not against [`size`](Self::size).
    pub fn pixel_size(&self) -> (i64, i64) {
        let (width, height) = self.size();
        (width * 8, height * 8)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns the latent moved to `device`; a no-op when it already lives
    /// there.
    pub fn with_device(mut self, device: Device) -> Self {
        if device == self.device {
            return self;
        }
        self.samples = self.samples.to(device);
        self.noise_mask = self.noise_mask.map(|m| m.to(device));
        self.device = device;
        self
    }

    /// Overlays `from` onto a copy of `to` at the pixel offset `(x, y)`.
    ///
    /// With `feather == 0` the overlapping region is replaced outright. With
    /// `feather > 0` the first `feather / 8` latent rows/columns from each
    /// touched interior edge blend in with weights rising from `1/feather`
    /// up to 1; edges sitting on the array boundary are left hard. Both
    /// latents must have the same size. The result carries `to`'s noise mask.
    pub fn combine(
        to: &LatentImage,
        from: &LatentImage,
        x: i64,
        y: i64,
        feather: i64,
    ) -> Result<LatentImage> {
        let x = utils::check_divisible_by_8(x)?;
        let y = utils::check_divisible_by_8(y)?;
        let feather = utils::check_divisible_by_8(feather)?;
        assert_eq!(to.size(), from.size(), "combine requires latents of identical size");

        let s = to.samples.copy();
        let (width, height) = from.size();
        let (to_width, to_height) = to.size();
        let eff_height = height - y;
        let eff_width = width - x;
        let region_from = from.samples.narrow(2, 0, eff_height).narrow(3, 0, eff_width);
        let mask_out = to.noise_mask.as_ref().map(|m| m.shallow_clone());

        if feather == 0 {
            let mut dst = s.narrow(2, y, eff_height).narrow(3, x, eff_width);
            dst.copy_(&region_from);
            return Ok(LatentImage::new(s, mask_out));
        }

        let mask = Tensor::ones_like(&region_from);
        for t in 0..feather {
            let c = (t + 1) as f64 / feather as f64;
            if y != 0 {
                let mut band = mask.narrow(2, t, 1);
                band *= c;
            }
            if y + height < to_height {
                let mut band = mask.narrow(2, eff_height - 1 - t, 1);
                band *= c;
            }
            if x != 0 {
                let mut band = mask.narrow(3, t, 1);
                band *= c;
            }
            if x + width < to_width {
                let mut band = mask.narrow(3, eff_width - 1 - t, 1);
                band *= c;
            }
        }
        let rev_mask = 1 - &mask;
        let region_to = s.narrow(2, y, eff_height).narrow(3, x, eff_width);
        let blended = &region_from * &mask + region_to * rev_mask;
        let mut dst = s.narrow(2, y, eff_height).narrow(3, x, eff_width);
        dst.copy_(&blended);
        Ok(LatentImage::new(s, mask_out))
    }

    /// Resamples the latent to a new pixel size. The noise mask is dropped.
    pub fn upscale(
        &self,
        width: i64,
        height: i64,
        method: UpscaleMethod,
        crop: CropMethod,
    ) -> Result<LatentImage> {
        let width = utils::check_divisible_by_8(width)?;
        let height = utils::check_divisible_by_8(height)?;
        let samples = utils::common_upscale(&self.samples, width, height, method, crop);
        Ok(LatentImage::new(samples, None))
    }

    /// Attaches a greyscale noise mask covering the image. The mask's pixel
    /// size must equal [`pixel_size`](Self::pixel_size). The samples are
    /// shared with the new value.
    pub fn set_mask(&self, mask: &DynamicImage) -> LatentImage {
        let (mask_width, mask_height) = mask.dimensions();
        assert_eq!(
            (mask_width as i64, mask_height as i64),
            self.pixel_size(),
            "noise mask must cover the image"
        );
        let mask_t = utils::image_to_greyscale_tensor(mask);
        LatentImage::new(self.samples.shallow_clone(), Some(mask_t))
    }

    /// Exports the sample tensor and noise mask for the sampler.
    pub fn to_state(&self) -> LatentState {
        LatentState {
            samples: self.samples.shallow_clone(),
            noise_mask: self.noise_mask.as_ref().map(|m| m.shallow_clone()),
        }
    }

    /// Rewraps a sampler result as a latent image.
    pub fn from_state(state: LatentState) -> LatentImage {
        LatentImage::new(state.samples, state.noise_mask)
    }
}
