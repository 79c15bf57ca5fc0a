pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod node;
pub mod registry;
pub mod remote;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
pub mod workflow;

pub use context::JobContext;
pub use error::{DispatchError, Result};
pub use registry::ServiceRegistry;
