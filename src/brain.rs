use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{info, warn};
use ndarray::Array2;
use serde::Serialize;

use crate::config::{GenerationConfig, NetConfig};
use crate::error::Result;
use crate::maintenance::MaintenanceReport;
use crate::model::{GrowingNetwork, GrowthHook};
use crate::model_loader::load_with_migration;

/// Summary counters for one brain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrainStats {
    pub name: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub step: u64,
    pub interactions: u64,
    pub characters_total: u64,
    pub active_weights: usize,
    pub total_parameters: usize,
}

/// A named network behind its own lock, persisted at a fixed path.
///
/// Every method takes the lock once and works on the network through plain
/// `&mut` calls, so nested work (generation calling forward, learning
/// triggering growth and the growth hook) never re-enters the lock.
/// Separate brains share nothing.
#[derive(Debug)]
pub struct Brain {
    name: String,
    path: PathBuf,
    net: Mutex<GrowingNetwork>,
}

impl Brain {
    pub fn new<P: Into<PathBuf>>(name: &str, path: P, net: GrowingNetwork) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            net: Mutex::new(net),
        }
    }

    /// Loads the brain at `path`, migrating a legacy dump if that is all
    /// there is. Unreadable snapshots are logged and replaced by a fresh
    /// network built from `config`.
    pub fn open_or_create<P: Into<PathBuf>>(name: &str, path: P, config: &NetConfig) -> Self {
        let path = path.into();
        let net = match load_with_migration(&path, config) {
            Ok(Some(net)) => {
                info!(
                    "{}: loaded from {} (hidden {}, vocab {})",
                    name,
                    path.display(),
                    net.hidden_size(),
                    net.vocab_size()
                );
                net
            }
            Ok(None) => {
                info!("{}: no snapshot at {}, starting fresh", name, path.display());
                GrowingNetwork::with_config(&config.vocabulary, config.hidden_size, config)
            }
            Err(e) => {
                warn!(
                    "{}: could not load {} ({}), starting fresh",
                    name,
                    path.display(),
                    e
                );
                GrowingNetwork::with_config(&config.vocabulary, config.hidden_size, config)
            }
        };
        Self::new(name, path, net)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A panic while holding the lock cannot leave the store out of shape
    /// (every resize asserts before returning), so a poisoned lock is reused.
    fn lock(&self) -> MutexGuard<'_, GrowingNetwork> {
        self.net.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` with exclusive access, for callers that need several
    /// operations to happen atomically.
    pub fn with_network<R>(&self, f: impl FnOnce(&mut GrowingNetwork) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn learn(&self, text: &str, epochs: usize, learning_rate: Option<f32>) -> Option<f32> {
        self.lock().learn(text, epochs, learning_rate)
    }

    pub fn forward(&self, indices: &[usize]) -> Array2<f32> {
        self.lock().forward(indices)
    }

    pub fn generate(&self, seed: &str, config: &GenerationConfig) -> String {
        self.lock().generate(seed, config)
    }

    pub fn confidence(&self, text: &str) -> f32 {
        self.lock().confidence(text)
    }

    pub fn sleep(&self, prune_fraction: f32, reinforce_factor: f32) -> MaintenanceReport {
        self.lock().sleep(prune_fraction, reinforce_factor)
    }

    pub fn rest_lightly(&self, reinforce_factor: f32) -> MaintenanceReport {
        self.lock().rest_lightly(reinforce_factor)
    }

    /// The hook runs while this brain is locked and must not call back into it.
    pub fn set_growth_hook(&self, hook: GrowthHook) {
        self.lock().set_growth_hook(hook);
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&self.path)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.lock().save(path)
    }

    /// Replaces this brain with the snapshot at `source` and persists it at
    /// this brain's own path. Returns the new hidden size. The growth hook,
    /// if any, carries over.
    pub fn replace_from<P: AsRef<Path>>(&self, source: P) -> Result<usize> {
        let mut replacement = GrowingNetwork::load(source.as_ref())?;
        let mut net = self.lock();
        replacement.growth_hook = net.growth_hook.take();
        replacement.save(&self.path)?;
        *net = replacement;
        info!(
            "{}: replaced from {} (hidden {})",
            self.name,
            source.as_ref().display(),
            net.hidden_size()
        );
        Ok(net.hidden_size())
    }

    pub fn stats(&self) -> BrainStats {
        let net = self.lock();
        BrainStats {
            name: self.name.clone(),
            vocab_size: net.vocab_size(),
            hidden_size: net.hidden_size(),
            step: net.step(),
            interactions: net.interactions(),
            characters_total: net.characters_total(),
            active_weights: net.params().active_weights(),
            total_parameters: net.params().total_parameters(),
        }
    }

    /// Size of the persisted snapshot, or `None` if it has not been saved.
    pub fn snapshot_size_bytes(&self) -> Option<u64> {
        fs::metadata(&self.path).ok().map(|m| m.len())
    }
}
