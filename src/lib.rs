pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::{orchestrator, registry, router, shell};
pub use config::AppConfig;
pub use domain::types;
pub use infrastructure::{model, session, transport};
