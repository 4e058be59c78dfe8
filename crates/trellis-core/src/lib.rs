pub mod body;
pub mod config;
pub mod error;
pub mod event;
pub mod hooks;
pub mod policy;
pub mod traits;
pub mod types;

pub use body::{BodyRegistry, NodeBody, StandardBody};
pub use config::AppConfig;
pub use error::{Result, TokenBreakdown, TrellisError};
pub use event::EventBus;
pub use hooks::EventHooks;
pub use policy::DefaultPolicy;
pub use types::*;
