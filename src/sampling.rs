//! # Sampler orchestration
//!
//! Prepares noise, noise masks and conditioning batches for a denoising run,
//! then dispatches to an external sampler. The sampler itself, the diffusion
//! model and GPU memory management are collaborators supplied through
//! [`SamplerBackend`]; this layer only owns the data-shape bookkeeping and
//! the control-net lifecycle around a single sample call.
use crate::latent::LatentState;
use anyhow::Result;
use log::debug;
use std::sync::Arc;
use tch::{Device, Tensor};

/// An auxiliary conditioning network steering the diffusion model, with its
/// own load/cleanup lifecycle on the compute device.
pub trait ControlNet {
    /// An opaque handle to a compute model the backend can load onto the
    /// device.
    type Handle;

    fn control_models(&self) -> Vec<Self::Handle>;

    /// Releases device-resident state. Invoked unconditionally after every
    /// sample call the control net took part in.
    fn cleanup(&self);
}

/// A conditioning entry: an embedding tensor plus an optional control net
/// reference.
#[derive(Debug)]
pub struct Conditioning<C> {
    pub embedding: Tensor,
    pub control: Option<Arc<C>>,
}

impl<C> Conditioning<C> {
    pub fn new(embedding: Tensor) -> Self {
        Self { embedding, control: None }
    }

    pub fn with_control(embedding: Tensor, control: Arc<C>) -> Self {
        Self { embedding, control: Some(control) }
    }
}

/// Hyperparameters of a single sample call.
#[derive(Debug, Clone)]
pub struct SampleOptions {
    pub seed: i64,
    pub steps: usize,
    pub cfg_scale: f64,
    pub sampler_name: String,
    pub scheduler: String,
    /// Denoise strength in `[0, 1]`; 1 regenerates the latent completely.
    pub denoise: f64,
    /// When set, the noise tensor is all-zero instead of seeded Gaussian.
    pub disable_noise: bool,
    pub start_step: Option<usize>,
    pub last_step: Option<usize>,
    pub force_full_denoise: bool,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            steps: 20,
            cfg_scale: 8.0,
            sampler_name: "euler".to_string(),
            scheduler: "normal".to_string(),
            denoise: 1.0,
            disable_noise: false,
            start_step: None,
            last_step: None,
            force_full_denoise: false,
        }
    }
}

/// What a backend needs to construct a sampler bound to a model.
#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig<'a> {
    pub steps: usize,
    pub device: Device,
    pub sampler_name: &'a str,
    pub scheduler: &'a str,
    pub denoise: f64,
}

/// The fully prepared input handed to [`Sampler::sample`].
pub struct SampleInput<'a, C> {
    pub noise: Tensor,
    pub positive: Vec<Conditioning<C>>,
    pub negative: Vec<Conditioning<C>>,
    pub cfg_scale: f64,
    pub latent_image: &'a Tensor,
    pub start_step: Option<usize>,
    pub last_step: Option<usize>,
    pub force_full_denoise: bool,
    /// Binary mask expanded to the noise's full shape, when the latent
    /// carried one.
    pub denoise_mask: Option<Tensor>,
}

/// A sampler bound to a model; performs the numerical integration.
pub trait Sampler<C: ControlNet> {
    fn sample(&self, input: SampleInput<'_, C>) -> Result<Tensor>;
}

/// The external collaborators of a sample call: a sampler factory and the
/// device memory manager loading control models.
pub trait SamplerBackend {
    type Model;
    type ControlNet: ControlNet;
    type Sampler: Sampler<Self::ControlNet>;

    fn load_control_models(
        &self,
        models: &[<Self::ControlNet as ControlNet>::Handle],
    ) -> Result<()>;

    fn build_sampler(
        &self,
        model: &Self::Model,
        config: SamplerConfig<'_>,
    ) -> Result<Self::Sampler>;
}

/// Builds the noise tensor for a latent. Noise is always generated on the
/// host so that a given `(seed, shape)` pair yields bit-identical values
/// regardless of the compute device.
pub fn prepare_noise(latent: &Tensor, seed: i64, disable_noise: bool) -> Tensor {
    if disable_noise {
        return Tensor::zeros(latent.size().as_slice(), (latent.kind(), Device::Cpu));
    }
    tch::manual_seed(seed);
    Tensor::randn(latent.size().as_slice(), (latent.kind(), Device::Cpu))
}

// Resizes a (height, width) pixel mask to the noise's spatial dims, snaps it
// to {0, 1} and replicates it across the channel and batch dims.
fn expand_noise_mask(mask: &Tensor, noise: &Tensor) -> Tensor {
    let (batch, channels, height, width) = noise.size4().unwrap();
    mask.unsqueeze(0)
        .unsqueeze(0)
        .upsample_bilinear2d([height, width], false, None, None)
        .round()
        .repeat([batch, channels, 1, 1])
}

// Replicates embeddings whose batch dim is smaller than the noise batch dim.
fn batch_conditioning<C>(entries: &[Conditioning<C>], batch: i64) -> Vec<Conditioning<C>> {
    entries
        .iter()
        .map(|entry| {
            let embedding = if entry.embedding.size()[0] < batch {
                let copies: Vec<Tensor> =
                    (0..batch).map(|_| entry.embedding.shallow_clone()).collect();
                Tensor::cat(&copies, 0)
            } else {
                entry.embedding.shallow_clone()
            };
            Conditioning { embedding, control: entry.control.clone() }
        })
        .collect()
}

fn collect_control_nets<C>(entries: &[Conditioning<C>], out: &mut Vec<Arc<C>>) {
    for entry in entries {
        if let Some(control) = &entry.control {
            out.push(control.clone());
        }
    }
}

// Runs cleanup on every referenced control net when the sample call unwinds,
// whether it succeeded or not.
struct ControlNetGuard<'a, C: ControlNet>(&'a [Arc<C>]);

impl<C: ControlNet> Drop for ControlNetGuard<'_, C> {
    fn drop(&mut self) {
        for control in self.0 {
            control.cleanup();
        }
    }
}

/// Denoises a latent: prepares noise, mask and conditioning, loads the
/// referenced control models, runs the backend's sampler and returns the
/// updated latent state. The input's noise mask is carried over unchanged.
pub fn sample<B: SamplerBackend>(
    backend: &B,
    model: &B::Model,
    device: Device,
    options: &SampleOptions,
    positive: &[Conditioning<B::ControlNet>],
    negative: &[Conditioning<B::ControlNet>],
    latent: &LatentState,
) -> Result<LatentState> {
    let noise = prepare_noise(&latent.samples, options.seed, options.disable_noise);
    let denoise_mask = latent.noise_mask.as_ref().map(|m| expand_noise_mask(m, &noise));
    let noise = noise.to(device);

    let batch = noise.size()[0];
    let positive = batch_conditioning(positive, batch);
    let negative = batch_conditioning(negative, batch);

    let mut control_nets = Vec::new();
    collect_control_nets(&positive, &mut control_nets);
    collect_control_nets(&negative, &mut control_nets);
    let _cleanup = ControlNetGuard(&control_nets);

    let control_models: Vec<_> =
        control_nets.iter().flat_map(|c| c.control_models()).collect();
    debug!(
        "sampling {} steps with {}/{}, batch {}, {} control models",
        options.steps,
        options.sampler_name,
        options.scheduler,
        batch,
        control_models.len()
    );
    backend.load_control_models(&control_models)?;

    let sampler = backend.build_sampler(
        model,
        SamplerConfig {
            steps: options.steps,
            device,
            sampler_name: &options.sampler_name,
            scheduler: &options.scheduler,
            denoise: options.denoise,
        },
    )?;
    let samples = sampler.sample(SampleInput {
        noise,
        positive,
        negative,
        cfg_scale: options.cfg_scale,
        latent_image: &latent.samples,
        start_step: options.start_step,
        last_step: options.last_step,
        force_full_denoise: options.force_full_denoise,
        denoise_mask,
    })?;

    Ok(LatentState {
        samples,
        noise_mask: latent.noise_mask.as_ref().map(|m| m.shallow_clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tch::Kind;

    struct TestControl {
        models: Vec<usize>,
        cleanups: AtomicUsize,
    }

    impl TestControl {
        fn new(models: Vec<usize>) -> Arc<Self> {
            Arc::new(Self { models, cleanups: AtomicUsize::new(0) })
        }
    }

    impl ControlNet for TestControl {
        type Handle = usize;

        fn control_models(&self) -> Vec<usize> {
            self.models.clone()
        }

        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Recorded {
        noise: Option<Tensor>,
        positive_batches: Vec<i64>,
        negative_batches: Vec<i64>,
        denoise_mask: Option<Tensor>,
    }

    struct TestSampler {
        recorded: Rc<RefCell<Recorded>>,
        fail: bool,
    }

    impl Sampler<TestControl> for TestSampler {
        fn sample(&self, input: SampleInput<'_, TestControl>) -> Result<Tensor> {
            if self.fail {
                anyhow::bail!("sampler failure");
            }
            let mut recorded = self.recorded.borrow_mut();
            recorded.noise = Some(input.noise.shallow_clone());
            recorded.positive_batches =
                input.positive.iter().map(|c| c.embedding.size()[0]).collect();
            recorded.negative_batches =
                input.negative.iter().map(|c| c.embedding.size()[0]).collect();
            recorded.denoise_mask = input.denoise_mask.map(|m| m.shallow_clone());
            Ok(input.latent_image + 1.0)
        }
    }

    #[derive(Default)]
    struct TestBackend {
        recorded: Rc<RefCell<Recorded>>,
        loaded: RefCell<Vec<usize>>,
        fail_sampler: bool,
    }

    impl SamplerBackend for TestBackend {
        type Model = ();
        type ControlNet = TestControl;
        type Sampler = TestSampler;

        fn load_control_models(&self, models: &[usize]) -> Result<()> {
            self.loaded.borrow_mut().extend_from_slice(models);
            Ok(())
        }

        fn build_sampler(&self, _model: &(), config: SamplerConfig<'_>) -> Result<TestSampler> {
            assert!(config.steps > 0);
            Ok(TestSampler { recorded: self.recorded.clone(), fail: self.fail_sampler })
        }
    }

    fn latent(batch: i64) -> LatentState {
        LatentState {
            samples: Tensor::zeros([batch, 4, 8, 8], (Kind::Float, Device::Cpu)),
            noise_mask: None,
        }
    }

    #[test]
    fn noise_is_deterministic_for_a_seed() {
        let samples = Tensor::zeros([1, 4, 8, 8], (Kind::Float, Device::Cpu));
        let a = prepare_noise(&samples, 42, false);
        let b = prepare_noise(&samples, 42, false);
        assert_eq!((a.shallow_clone() - &b).abs().max().double_value(&[]), 0.0);
        let c = prepare_noise(&samples, 43, false);
        assert!((a - c).abs().max().double_value(&[]) > 0.0);
    }

    #[test]
    fn disabled_noise_is_all_zero() {
        let samples = Tensor::ones([2, 4, 8, 8], (Kind::Float, Device::Cpu));
        let noise = prepare_noise(&samples, 7, true);
        assert_eq!(noise.size(), vec![2, 4, 8, 8]);
        assert_eq!(noise.abs().max().double_value(&[]), 0.0);
    }

    #[test]
    fn sample_replaces_samples_and_keeps_the_mask() {
        let backend = TestBackend::default();
        let mut latent = latent(1);
        latent.noise_mask = Some(Tensor::ones([64, 64], (Kind::Float, Device::Cpu)));
        let options = SampleOptions { disable_noise: true, ..Default::default() };
        let out =
            sample(&backend, &(), Device::Cpu, &options, &[], &[], &latent).unwrap();
        assert_eq!((out.samples - 1.0).abs().max().double_value(&[]), 0.0);
        assert_eq!(out.noise_mask.unwrap().size(), vec![64, 64]);
    }

    #[test]
    fn noise_mask_is_expanded_to_the_noise_shape() {
        let backend = TestBackend::default();
        let mut latent = latent(2);
        latent.noise_mask = Some(Tensor::ones([64, 64], (Kind::Float, Device::Cpu)));
        let options = SampleOptions::default();
        sample(&backend, &(), Device::Cpu, &options, &[], &[], &latent).unwrap();
        let recorded = backend.recorded.borrow();
        let mask = recorded.denoise_mask.as_ref().unwrap();
        assert_eq!(mask.size(), vec![2, 4, 8, 8]);
        // Snapped to {0, 1}.
        assert_eq!((mask.shallow_clone() - mask.round()).abs().max().double_value(&[]), 0.0);
    }

    #[test]
    fn small_conditioning_batches_are_replicated() {
        let backend = TestBackend::default();
        let positive = [Conditioning::<TestControl>::new(Tensor::ones(
            [1, 77, 768],
            (Kind::Float, Device::Cpu),
        ))];
        let negative = [Conditioning::<TestControl>::new(Tensor::ones(
            [4, 77, 768],
            (Kind::Float, Device::Cpu),
        ))];
        let options = SampleOptions::default();
        sample(&backend, &(), Device::Cpu, &options, &positive, &negative, &latent(4)).unwrap();
        let recorded = backend.recorded.borrow();
        assert_eq!(recorded.positive_batches, vec![4]);
        assert_eq!(recorded.negative_batches, vec![4]);
    }

    #[test]
    fn control_models_from_both_lists_are_loaded() {
        let backend = TestBackend::default();
        let pos_control = TestControl::new(vec![1, 2]);
        let neg_control = TestControl::new(vec![3]);
        let embedding = || Tensor::ones([1, 77, 768], (Kind::Float, Device::Cpu));
        let positive = [Conditioning::with_control(embedding(), pos_control.clone())];
        let negative = [Conditioning::with_control(embedding(), neg_control.clone())];
        let options = SampleOptions::default();
        sample(&backend, &(), Device::Cpu, &options, &positive, &negative, &latent(1)).unwrap();
        assert_eq!(*backend.loaded.borrow(), vec![1, 2, 3]);
        assert_eq!(pos_control.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(neg_control.cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn negative_control_nets_are_collected() {
        // The negative list's own control references are honored, not the
        // positive entry's.
        let backend = TestBackend::default();
        let neg_control = TestControl::new(vec![9]);
        let positive =
            [Conditioning::<TestControl>::new(Tensor::ones([1, 77, 768], (Kind::Float, Device::Cpu)))];
        let negative = [Conditioning::with_control(
            Tensor::ones([1, 77, 768], (Kind::Float, Device::Cpu)),
            neg_control.clone(),
        )];
        let options = SampleOptions::default();
        sample(&backend, &(), Device::Cpu, &options, &positive, &negative, &latent(1)).unwrap();
        assert_eq!(*backend.loaded.borrow(), vec![9]);
        assert_eq!(neg_control.cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_runs_when_the_sampler_fails() {
        let backend = TestBackend { fail_sampler: true, ..Default::default() };
        let control = TestControl::new(vec![5]);
        let positive = [Conditioning::with_control(
            Tensor::ones([1, 77, 768], (Kind::Float, Device::Cpu)),
            control.clone(),
        )];
        let options = SampleOptions::default();
        let result = sample(&backend, &(), Device::Cpu, &options, &positive, &[], &latent(1));
        assert!(result.is_err());
        assert_eq!(control.cleanups.load(Ordering::SeqCst), 1);
    }
}
