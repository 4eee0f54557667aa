use std::env;
use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Unset runs against the in-memory store (local mode).
    pub database_url: Option<String>,
    pub listen_addr: SocketAddr,
    pub control_plane_api_key: String,
    pub metrics_interval_secs: u64,
    pub worker_count: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").ok(),
            listen_addr: env::var("LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".into())
                .parse()
                .expect("LISTEN_ADDR must be a valid socket address"),
            control_plane_api_key: env::var("CONTROL_PLANE_API_KEY")
                .expect("CONTROL_PLANE_API_KEY must be set"),
            metrics_interval_secs: env::var("METRICS_INTERVAL_SECS")
                .unwrap_or_else(|_| "300".into())
                .parse()
                .expect("METRICS_INTERVAL_SECS must be a valid u64"),
            worker_count: env::var("WORKER_COUNT")
                .unwrap_or_else(|_| "4".into())
                .parse()
                .expect("WORKER_COUNT must be a valid usize"),
        }
    }
}
