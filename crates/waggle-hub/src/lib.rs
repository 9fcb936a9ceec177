//! # waggle-hub
//!
//! The network-facing hub: SSE event streams with a paired message ingress,
//! the tool table over every service, bearer-token auth for the admin
//! surface, and the composition root that wires the whole fabric together.

pub mod auth;
pub mod config;
pub mod hub;
pub mod routes;
pub mod session;
pub mod tools;

pub use auth::AuthService;
pub use config::HubConfig;
pub use hub::Hub;
pub use session::{Frame, SessionTable};
