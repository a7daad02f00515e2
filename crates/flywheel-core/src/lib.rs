pub mod config;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod ids;

pub use config::EngineConfig;
pub use errors::DispatchError;
pub use events::{BroadcastEvent, EventKind};
