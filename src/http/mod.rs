//! HTTP API: admission-gated demo routes, URL and custom endpoint testing,
//! monitoring and analytics.

mod handlers;
mod server;
mod state;

pub use server::HttpServer;
pub use state::{AppState, ClientInfo, LastClient};
