use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration surface.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub media: MediaConfig,
    pub cors: CorsConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub database_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Extra shared-secret gate some self-hosted deployments layer on top of
    /// per-user tokens. Empty disables it.
    #[serde(default)]
    pub server_password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_media_worker_count")]
    pub worker_count: u32,
    pub native_rtp_listen_ip: String,
    pub native_rtp_announced_ip: String,
}

fn default_media_worker_count() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// Explicit allow-list — never a wildcard in production.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl HubConfig {
    /// Load configuration from `yankcord.toml`, with environment variable
    /// overrides under the `YANKCORD__SECTION__KEY` prefix.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("YANKCORD_CONFIG").unwrap_or_else(|_| "yankcord.toml".to_string());

        let builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("auth.server_password", "")?
            .set_default("media.worker_count", 2)?
            .set_default("media.native_rtp_listen_ip", "0.0.0.0")?
            .set_default("media.native_rtp_announced_ip", "127.0.0.1")?
            .set_default("cors.allowed_origins", Vec::<String>::new())?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?;

        let builder = if Path::new(&config_path).exists() {
            builder.add_source(config::File::with_name(&config_path))
        } else {
            tracing::warn!(path = %config_path, "config file not found, using defaults");
            builder
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix("YANKCORD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: HubConfig = settings.try_deserialize()?;
        Ok(config)
    }
}
