pub mod api;
pub mod auth;
pub mod capture;
pub mod config;
pub mod flags;
pub mod metrics_middleware;
pub mod prometheus;
pub mod recordings;
pub mod redis;
pub mod request;
pub mod router;
pub mod server;
pub mod sinks;
pub mod team;
pub mod time;
