pub mod config;
pub mod health;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod websocket;
pub mod worker;

pub use config::{ConfigError, ServerConfig};
pub use registry::WorkerRegistry;
pub use server::CourierServer;
pub use session::{run_session, SessionConfig, SessionEnd, SessionSummary};
pub use worker::{WorkerConfig, WorkerHandle, WorkerState};
