//! Tensor and image helpers shared by the latent and VAE layers.
use crate::latent::LatentError;
use image::{DynamicImage, GenericImageView};
use tch::{Kind, Tensor};

/// The interpolation used when resampling a latent tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpscaleMethod {
    Nearest,
    Bilinear,
    Area,
}

/// Whether to center-crop to the target aspect ratio before resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropMethod {
    Disabled,
    Center,
}

/// Converts an image to a float tensor of shape `(1, height, width, 3)` with
/// values in `[0, 1]`, the channel-last layout the wrapped VAE consumes.
pub fn image_to_rgb_tensor(image: &DynamicImage) -> Tensor {
    let (width, height) = image.dimensions();
    let data = image.to_rgb8().into_raw();
    let t = Tensor::from_slice(&data).view([height as i64, width as i64, 3]);
    t.to_kind(Kind::Float).unsqueeze(0) / 255.
}

/// Converts an image to a greyscale float tensor of shape `(height, width)`
/// with values in `[0, 1]`.
pub fn image_to_greyscale_tensor(image: &DynamicImage) -> Tensor {
    let (width, height) = image.dimensions();
    let data = image.to_luma8().into_raw();
    let t = Tensor::from_slice(&data).view([height as i64, width as i64]);
    t.to_kind(Kind::Float) / 255.
}

/// Checks that a pixel dimension is a multiple of the latent downsampling
/// factor and returns it in latent units.
pub fn check_divisible_by_8(value: i64) -> Result<i64, LatentError> {
    if value % 8 != 0 {
        return Err(LatentError::NotMultipleOf { value, multiple: 8 });
    }
    Ok(value / 8)
}

/// Checks the stricter divisibility constraint of the inpainting encode path.
pub fn check_divisible_by_64(value: i64) -> Result<(), LatentError> {
    if value % 64 != 0 {
        return Err(LatentError::NotMultipleOf { value, multiple: 64 });
    }
    Ok(())
}

/// Resamples a `(batch, channel, height, width)` tensor to the requested
/// spatial size, optionally center-cropping to the target aspect ratio first.
pub fn common_upscale(
    samples: &Tensor,
    width: i64,
    height: i64,
    method: UpscaleMethod,
    crop: CropMethod,
) -> Tensor {
    let s = match crop {
        CropMethod::Disabled => samples.shallow_clone(),
        CropMethod::Center => {
            let (_, _, old_height, old_width) = samples.size4().unwrap();
            let old_aspect = old_width as f64 / old_height as f64;
            let new_aspect = width as f64 / height as f64;
            let mut x = 0;
            let mut y = 0;
            if old_aspect > new_aspect {
                x = ((old_width as f64 * (1. - new_aspect / old_aspect)) / 2.).round() as i64;
            } else if old_aspect < new_aspect {
                y = ((old_height as f64 * (1. - old_aspect / new_aspect)) / 2.).round() as i64;
            }
            samples.narrow(2, y, old_height - 2 * y).narrow(3, x, old_width - 2 * x)
        }
    };
    match method {
        UpscaleMethod::Nearest => s.upsample_nearest2d([height, width], None, None),
        UpscaleMethod::Bilinear => s.upsample_bilinear2d([height, width], false, None, None),
        UpscaleMethod::Area => s.adaptive_avg_pool2d([height, width]),
    }
}
