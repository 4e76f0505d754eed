pub mod config;
pub mod resource_id;
pub mod types;

pub use config::KeelConfig;
pub use resource_id::{agent_of, ResourceId, ResourceIdError, ResourceIdStr};
pub use types::*;
