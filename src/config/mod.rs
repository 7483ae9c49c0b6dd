//! Layered engine configuration
//!
//! Three layers, later ones winning:
//! 1. Built-in defaults
//! 2. Optional TOML file (`--config`)
//! 3. CLI flags
//!
//! The merged result is validated, turned into [`EngineSettings`], and
//! recorded with its provenance next to the status file.

mod defaults;
mod effective;
mod merge;
mod settings;

pub use defaults::BuiltinDefaults;
pub use effective::{ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig, EFFECTIVE_CONFIG_NAME};
pub use merge::{deep_merge, merge_layers};
pub use settings::{EngineSettings, LogLevel, TerminationSettings};
