//! SSH server module.

pub mod auth;
mod handler;
mod handler_impl;
mod server;
pub mod session;
pub mod tunnel;
pub mod types;

pub use auth::{slowdown, AuthorizationEngine};
pub use handler::SshHandler;
pub use server::GatewayServer;
pub use tunnel::{BackendResolver, DockerBackend, ForwardingGateway};
pub use types::{ForwardRejection, ForwardRequest, PermissionMap};
