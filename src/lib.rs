//! # Latent diffusion orchestration
//!
//! Glue code around a latent-diffusion image-generation stack using Torch via
//! the [tch-rs](https://github.com/LaurentMazare/tch-rs) bindings.
//!
//! This library includes:
//! - A [`latent::LatentImage`] value type for latent-space tensors with
//!   optional noise masks, compositing and resizing.
//! - A sampler orchestrator preparing noise, masks and conditioning batches
//!   before dispatching to an external sampler.
//! - A [`vae::VaeModel`] facade for image to latent encoding and decoding,
//!   including an inpainting-aware encode.
//!
//! The diffusion sampler, the VAE network and GPU memory management live
//! behind the [`sampling::SamplerBackend`] and [`vae::VaeBackend`] traits and
//! are supplied by the caller.

pub mod latent;
pub mod sampling;
pub mod utils;
pub mod vae;
