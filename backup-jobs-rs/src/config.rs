use backup_engine::EngineConfig;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub external_io_dir: PathBuf,
    pub node_id: u32,
    /// Optional TOML file with engine tuning; env values below override it.
    pub engine_config: Option<PathBuf>,
    pub log_level: String,
    pub adopt_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()));

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            db_path: data_dir.join("jobs.db"),
            external_io_dir: std::env::var("EXTERNAL_IO_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("extern")),
            data_dir,
            node_id: std::env::var("NODE_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            engine_config: std::env::var("ENGINE_CONFIG").ok().map(PathBuf::from),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            adopt_interval_secs: std::env::var("ADOPT_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    /// Engine settings for this node.
    pub fn engine(&self) -> anyhow::Result<EngineConfig> {
        let mut engine = match &self.engine_config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        engine.node.id = self.node_id;
        engine.node.external_io_dir = self.external_io_dir.clone();
        engine.jobs.adopt_interval_secs = self.adopt_interval_secs;
        engine.log.level = self.log_level.clone();
        engine.validate()?;
        Ok(engine)
    }
}
