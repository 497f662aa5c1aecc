//! Engine configuration
//!
//! Everything the engine needs to know before `prepare` runs: pool size,
//! time/pitch backend, envelope curve, anti-click window lengths, ratio
//! bounds and the output limiter. Configs are plain serde structs stored as
//! YAML; missing fields take their defaults.
//!
//! ```ignore
//! use tessera_core::config::{default_config_path, load_config, SamplerConfig};
//!
//! let config: SamplerConfig = load_config(&default_config_path("sampler.yaml"));
//! let (engine, control) = SamplerEngine::new(config);
//! ```

mod io;
mod paths;
mod sampler;

pub use io::{load_config, save_config};
pub use paths::{default_config_dir, default_config_path};
pub use sampler::{LimiterConfig, RatioBounds, SamplerConfig};
