pub mod api;
pub mod backend_client;
pub mod config;
pub mod flow;
pub mod http_client;
pub mod polling;
pub mod services;
pub mod session;
pub mod steps;
