//! # Model registry
//!
//! Owns the loaded model components. Loading happens once, on the first
//! `acquire`, under the registry lock. Each consumer holds a [`ModelLease`]
//! and the models can only be unloaded once every lease has been dropped.
use std::sync::{Arc, Mutex, MutexGuard};

use tch::Device;

use crate::config::{ExecutionTarget, PipelineConfig};
use crate::error::{Error, Result};
use crate::models::session::TorchScriptSession;
use crate::models::text_encoder::{self, TextProcessor};
use crate::models::unet::{self, DenoisingModel};
use crate::models::vae::{self, LatentDecoder};
use crate::transformers::clip::{self, ClipTokenizer};
use crate::utils::device_for;

/// The loaded networks used by a generation.
pub struct Components {
    pub text: TextProcessor,
    pub unet: DenoisingModel,
    pub vae: LatentDecoder,
    pub device: Device,
}

/// Builds the components for a device.
pub trait ComponentLoader: Send + Sync {
    fn load(&self, device: Device) -> Result<Components>;
}

/// Loads the tokenizer files and TorchScript checkpoints named by a
/// [`PipelineConfig`].
pub struct TorchScriptLoader {
    config: PipelineConfig,
}

impl TorchScriptLoader {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }
}

impl ComponentLoader for TorchScriptLoader {
    fn load(&self, device: Device) -> Result<Components> {
        let paths = self.config.resolve_paths()?;
        tracing::info!(model_dir = %self.config.model_dir().display(), ?device, "loading models");
        let tokenizer = ClipTokenizer::create(&paths.vocab, &paths.merges, clip::MAX_LENGTH)?;
        let text_encoder =
            TorchScriptSession::load(&paths.text_encoder, &[text_encoder::INPUT_IDS], device)?;
        let unet_session = TorchScriptSession::load(
            &paths.unet,
            &[unet::LATENT, unet::TIMESTEP, unet::TEXT_EMBED],
            device,
        )?;
        let vae_session = TorchScriptSession::load(&paths.vae_decoder, &[vae::LATENT], device)?;
        Ok(Components {
            text: TextProcessor::new(
                Box::new(tokenizer),
                Box::new(text_encoder),
                self.config.text_hidden_size(),
            ),
            unet: DenoisingModel::new(Box::new(unet_session)),
            vae: LatentDecoder::new(Box::new(vae_session)),
            device,
        })
    }
}

/// Loads on `device`, retrying on the CPU when an accelerated device fails.
pub(crate) fn load_with_fallback(loader: &dyn ComponentLoader, device: Device) -> Result<Components> {
    match loader.load(device) {
        Err(err) if device != Device::Cpu => {
            tracing::warn!(?device, %err, "failed to load models, falling back to cpu");
            loader.load(Device::Cpu)
        }
        result => result,
    }
}

#[derive(Default)]
struct Slot {
    components: Option<Arc<Mutex<Components>>>,
    consumers: usize,
}

struct Inner {
    loader: Box<dyn ComponentLoader>,
    target: ExecutionTarget,
    slot: Mutex<Slot>,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A cheaply cloneable handle on a set of lazily loaded models.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<Inner>,
}

impl ModelRegistry {
    pub fn new<L: ComponentLoader + 'static>(loader: L, target: ExecutionTarget) -> Self {
        let inner = Inner { loader: Box::new(loader), target, slot: Mutex::default() };
        Self { inner: Arc::new(inner) }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(TorchScriptLoader::new(config.clone()), config.execution_target())
    }

    /// Returns a lease on the models, loading them if needed.
    pub fn acquire(&self) -> Result<ModelLease> {
        let mut slot = self.inner.slot();
        let components = match &slot.components {
            Some(components) => components.clone(),
            None => {
                let device = device_for(self.inner.target);
                let components = load_with_fallback(self.inner.loader.as_ref(), device)?;
                tracing::info!(device = ?components.device, "models loaded");
                let components = Arc::new(Mutex::new(components));
                slot.components = Some(components.clone());
                components
            }
        };
        slot.consumers += 1;
        Ok(ModelLease { components, registry: self.inner.clone() })
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.slot().components.is_some()
    }

    /// Number of leases currently alive.
    pub fn consumers(&self) -> usize {
        self.inner.slot().consumers
    }

    /// Drops the loaded models, failing while some lease is still alive.
    pub fn unload(&self) -> Result<()> {
        let mut slot = self.inner.slot();
        if slot.consumers > 0 {
            return Err(Error::ModelsInUse(slot.consumers));
        }
        if slot.components.take().is_some() {
            tracing::info!("models unloaded");
        }
        Ok(())
    }
}

/// Shared access to the loaded models, counted by the registry.
pub struct ModelLease {
    components: Arc<Mutex<Components>>,
    registry: Arc<Inner>,
}

impl ModelLease {
    /// Exclusive access to the models for the duration of the guard.
    pub fn lock(&self) -> MutexGuard<'_, Components> {
        self.components.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        let mut slot = self.registry.slot();
        slot.consumers = slot.consumers.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::{InferenceSession, NamedInput};
    use crate::transformers::Tokenize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tch::Tensor;

    struct NullTokenizer;

    impl Tokenize for NullTokenizer {
        fn encode(&self, _text: &str) -> Result<Vec<i64>> {
            Ok(vec![0; 4])
        }

        fn max_length(&self) -> usize {
            4
        }
    }

    struct Zeros;

    impl InferenceSession for Zeros {
        fn run(&self, _inputs: &[NamedInput<'_>]) -> Result<Tensor> {
            Ok(Tensor::zeros([1], tch::kind::FLOAT_CPU))
        }
    }

    fn stub_components(device: Device) -> Components {
        Components {
            text: TextProcessor::new(Box::new(NullTokenizer), Box::new(Zeros), 8),
            unet: DenoisingModel::new(Box::new(Zeros)),
            vae: LatentDecoder::new(Box::new(Zeros)),
            device,
        }
    }

    #[derive(Clone, Default)]
    struct CountingLoader {
        loads: Arc<AtomicUsize>,
        devices: Arc<Mutex<Vec<Device>>>,
        fail_accelerated: bool,
    }

    impl ComponentLoader for CountingLoader {
        fn load(&self, device: Device) -> Result<Components> {
            self.devices.lock().unwrap().push(device);
            if self.fail_accelerated && device != Device::Cpu {
                return Err(Error::config("no accelerated backend"));
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(stub_components(device))
        }
    }

    #[test]
    fn concurrent_acquire_loads_once() {
        let loader = CountingLoader::default();
        let registry = ModelRegistry::new(loader.clone(), ExecutionTarget::Cpu);
        assert!(!registry.is_loaded());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.acquire().unwrap().lock().device)
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Device::Cpu);
        }
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert!(registry.is_loaded());
        assert_eq!(registry.consumers(), 0);
    }

    #[test]
    fn unload_is_refused_while_leased() {
        let loader = CountingLoader::default();
        let registry = ModelRegistry::new(loader.clone(), ExecutionTarget::Cpu);
        let lease = registry.acquire().unwrap();
        let second = registry.acquire().unwrap();
        assert_eq!(registry.consumers(), 2);
        assert!(matches!(registry.unload(), Err(Error::ModelsInUse(2))));
        drop(lease);
        drop(second);
        registry.unload().unwrap();
        assert!(!registry.is_loaded());

        // The next consumer reloads.
        let _lease = registry.acquire().unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn accelerated_failure_falls_back_to_cpu() {
        let loader = CountingLoader { fail_accelerated: true, ..Default::default() };
        let components = load_with_fallback(&loader, Device::Cuda(0)).unwrap();
        assert_eq!(components.device, Device::Cpu);
        assert_eq!(*loader.devices.lock().unwrap(), vec![Device::Cuda(0), Device::Cpu]);

        // No retry when the cpu itself fails.
        struct Failing;
        impl ComponentLoader for Failing {
            fn load(&self, _device: Device) -> Result<Components> {
                Err(Error::config("missing checkpoint"))
            }
        }
        assert!(load_with_fallback(&Failing, Device::Cpu).is_err());
        let registry = ModelRegistry::new(Failing, ExecutionTarget::Cpu);
        assert!(registry.acquire().is_err());
        assert_eq!(registry.consumers(), 0);
    }

    #[test]
    fn missing_checkpoints_are_configuration_errors() {
        let registry = ModelRegistry::from_config(&PipelineConfig::new("/no/such/models"));
        let err = registry.acquire().err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
