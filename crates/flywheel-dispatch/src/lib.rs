pub mod http;
pub mod mock;
pub mod pool;

pub use http::HttpExecutionTransport;
pub use pool::{PoolWorker, StaticPoolCoordinator};
