// src/config/mod.rs
//! Runtime configuration: `config/detection.toml` + env overrides.

pub mod ai;
pub mod detection;

pub use ai::AiConfig;
pub use detection::{
    AppConfig, DetectionConfig, IndexConfig, LearningConfig, StoreConfig,
    DEFAULT_DETECTION_CONFIG_PATH, ENV_DETECTION_CONFIG_PATH,
};
