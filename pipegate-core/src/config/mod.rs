//! Bridge configuration.
//!
//! The core only ever sees one normalised [`BridgeConfig`]. Reading YAML
//! files, substituting `${VAR}` references and layering CLI/environment
//! overrides all happen before the bridge starts.

pub mod defaults;
pub mod duration_format;
pub mod error;
pub mod loader;
pub mod schema;

pub use error::ConfigError;
pub use loader::{load_config, substitute_env_vars};
pub use schema::{
    BackendConfig, BackendSpec, BridgeConfig, ExitPolicy, RoutingMode, ServerConfig,
    SessionConfig,
};
