pub mod config;
pub mod types;

pub use config::QplaceConfig;
pub use types::*;
