use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{NetError, Result};

/// Characters every fresh brain starts with.
pub const DEFAULT_VOCABULARY: &str = " abcdefghijklmnopqrstuvwxyzáéíóúñ,.¿?¡!0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZÁÉÍÓÚÑ:;-_()[]{}\"'/@#$%&*+=\n\t";

pub const DEFAULT_HIDDEN_SIZE: usize = 128;

/// Hyperparameters for a network. Every field falls back to its default when
/// absent from the JSON file, so a config may name only what it overrides.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NetConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub hidden_size: usize,
    pub vocabulary: String,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            hidden_size: DEFAULT_HIDDEN_SIZE,
            vocabulary: DEFAULT_VOCABULARY.to_string(),
        }
    }
}

impl NetConfig {
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();
        if !config_path.exists() {
            return Err(NetError::Config(format!(
                "Config file not found at: {}",
                config_path.display()
            )));
        }

        let mut file = File::open(config_path).map_err(|e| {
            NetError::Config(format!("Failed to open config file {}: {}", config_path.display(), e))
        })?;

        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|e| {
            NetError::Config(format!("Failed to read config file {}: {}", config_path.display(), e))
        })?;

        let config: NetConfig = serde_json::from_str(&contents).map_err(|e| {
            NetError::Config(format!(
                "Failed to deserialize JSON from {}: {}",
                config_path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(NetError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(NetError::Config(format!(
                "beta1/beta2 must lie in [0, 1), got {}/{}",
                self.beta1, self.beta2
            )));
        }
        if self.hidden_size == 0 {
            return Err(NetError::Config("hidden_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Sampling parameters for one generation call.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_length: usize,
    pub temperature: f32,
    pub top_p: f32,
    /// 1.0 disables the penalty.
    pub repetition_penalty: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 80,
            temperature: 0.8,
            top_p: 0.9,
            repetition_penalty: 1.2,
        }
    }
}

impl GenerationConfig {
    /// Cooler, more repetition-averse sampling used for direct replies.
    pub fn focused() -> Self {
        Self {
            max_length: 80,
            temperature: 0.75,
            top_p: 0.85,
            repetition_penalty: 1.3,
        }
    }

    /// Plain softmax sampling: temperature 1, no nucleus cut, no penalty.
    pub fn unbiased(max_length: usize) -> Self {
        Self {
            max_length,
            temperature: 1.0,
            top_p: 1.0,
            repetition_penalty: 1.0,
        }
    }
}
