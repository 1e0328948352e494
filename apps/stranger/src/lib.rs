pub mod api;
pub mod config;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod transport;
