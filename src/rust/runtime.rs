use std::fmt;
use std::str::FromStr;

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use crate::classifier::ClassifierError;

/// Compute backend every tensor of a run lives on.
///
/// Selected by configuration and bound once at model/batch construction; the
/// numeric code never branches on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
}

impl Device {
    /// Resolves a device name. `auto` picks the best available backend.
    pub fn parse(name: &str) -> Result<Self, ClassifierError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" | "cpu" => Ok(Device::Cpu),
            other => Err(ClassifierError::ValidationError(format!(
                "Unsupported device '{}': only 'auto' and 'cpu' backends are available",
                other
            ))),
        }
    }
}

impl FromStr for Device {
    type Err = ClassifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Device::parse(s)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub device: Device,
    /// Worker threads for feature hashing; 0 lets rayon decide
    pub encode_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            encode_threads: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_encode_threads(mut self, threads: usize) -> Self {
        self.encode_threads = threads;
        self
    }
}

/// Builds the worker pool used for row encoding.
pub fn create_thread_pool(config: &RuntimeConfig) -> Result<ThreadPool, ClassifierError> {
    let mut builder = ThreadPoolBuilder::new().thread_name(|index| format!("encode-{index}"));
    if config.encode_threads > 0 {
        builder = builder.num_threads(config.encode_threads);
    }
    builder
        .build()
        .map_err(|e| ClassifierError::BuildError(format!("Failed to build encode thread pool: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_resolution() {
        assert_eq!(Device::parse("auto").unwrap(), Device::Cpu);
        assert_eq!("CPU".parse::<Device>().unwrap(), Device::Cpu);
        assert!(Device::parse("cuda").is_err());
        assert_eq!(Device::Cpu.to_string(), "cpu");
    }

    #[test]
    fn test_thread_pool_config() {
        let config = RuntimeConfig::default().with_encode_threads(2);
        let pool = create_thread_pool(&config).unwrap();
        assert_eq!(pool.current_num_threads(), 2);
    }
}
