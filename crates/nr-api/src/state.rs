use nr_engine::Services;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub svc: Services,
    pub config: AppConfig,
}
