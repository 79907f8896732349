pub mod config;
pub mod error;
pub mod identity;
pub mod types;

pub use config::{Config, PodcastConfig, PodcastRegistry, ProviderSpec, ProvidersConfig};
pub use error::{FailureClass, PodGraphError};
pub use identity::{
    canonical_name, entity_id, episode_id, insight_id, lower_snake, normalize, quote_id,
    sha256_hex, stable_id, unit_id,
};
pub use types::*;
