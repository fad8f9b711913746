use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::ws::ui::UiBroadcaster;
use backup_engine::JobService;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub service: JobService,
    pub ui: UiBroadcaster,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig, service: JobService) -> Self {
        Self {
            db,
            config,
            service,
            ui: UiBroadcaster::new(),
        }
    }
}
