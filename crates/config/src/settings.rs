use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub app: AppSettings,
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub jwt: JwtSettings,
    pub redis: RedisSettings,
    pub rate_limit: RateLimitSettings,
    pub mediasoup: MediasoupSettings,
    pub recording: RecordingSettings,
    pub aws: AwsSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Stable identifier of this instance among its peers. Empty means
    /// "generate one at startup".
    pub instance_id: String,
    /// Port the signaling WebSocket listener binds to. When it equals
    /// `app.port` a single listener serves both surfaces.
    pub signaling_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub name: String,
    pub max_pool_size: Option<u32>,
    pub min_pool_size: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JwtSettings {
    pub secret: String,
    pub access_token_ttl_secs: u64,
    pub refresh_token_ttl_secs: u64,
    pub issuer: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub cluster_enabled: bool,
    pub cluster_nodes: Vec<String>,
}

impl RedisSettings {
    /// Connection URL for the shared store. In cluster mode the first node
    /// is the contact point; topology discovery happens server-side.
    pub fn url(&self) -> String {
        let (host, port) = if self.cluster_enabled {
            self.cluster_nodes
                .first()
                .and_then(|n| {
                    let (h, p) = n.split_once(':')?;
                    Some((h.to_string(), p.parse().ok()?))
                })
                .unwrap_or_else(|| (self.host.clone(), self.port))
        } else {
            (self.host.clone(), self.port)
        };

        match &self.password {
            Some(pass) if !pass.is_empty() => {
                format!("redis://:{}@{}:{}", pass, host, port)
            }
            _ => format!("redis://{}:{}", host, port),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    pub max: u32,
    pub time_window_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediasoupSettings {
    /// 0 means one worker per CPU core.
    pub num_workers: u32,
    pub listen_ip: String,
    /// Empty means auto-detect from non-loopback, non-Docker interfaces.
    pub announced_ip: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
    pub log_tags: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecordingSettings {
    pub enabled: bool,
    pub tmp_dir: String,
    pub ffmpeg_path: String,
    pub layout: String,
    pub bind_ip: String,
    pub port_min: u16,
    pub port_max: u16,
    pub s3_bucket: Option<String>,
    pub s3_prefix: String,
    pub s3_sse: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AwsSettings {
    pub region: Option<String>,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::default()
                    .separator("__")
                    .prefix("CONNECT"),
            )
            .set_default("app.host", "0.0.0.0")?
            .set_default("app.port", 5000)?
            .set_default("app.cors_origins", Vec::<String>::new())?
            .set_default("server.instance_id", "")?
            .set_default("server.signaling_port", 5000)?
            .set_default("database.url", "mongodb://localhost:27017")?
            .set_default("database.name", "connect")?
            .set_default("jwt.secret", "change-me-in-production")?
            .set_default("jwt.access_token_ttl_secs", 3600)?
            .set_default("jwt.refresh_token_ttl_secs", 604800)?
            .set_default("jwt.issuer", "connect")?
            .set_default("redis.host", "127.0.0.1")?
            .set_default("redis.port", 6379)?
            .set_default("redis.password", None::<String>)?
            .set_default("redis.cluster_enabled", false)?
            .set_default("redis.cluster_nodes", Vec::<String>::new())?
            .set_default("rate_limit.max", 100)?
            .set_default("rate_limit.time_window_secs", 60)?
            .set_default("mediasoup.num_workers", 0)?
            .set_default("mediasoup.listen_ip", "0.0.0.0")?
            .set_default("mediasoup.announced_ip", "")?
            .set_default("mediasoup.rtc_min_port", 40000)?
            .set_default("mediasoup.rtc_max_port", 49999)?
            .set_default("mediasoup.log_level", "error")?
            .set_default("mediasoup.log_tags", Vec::<String>::new())?
            .set_default("recording.enabled", false)?
            .set_default("recording.tmp_dir", "/tmp/connect-recordings")?
            .set_default("recording.ffmpeg_path", "ffmpeg")?
            .set_default("recording.layout", "pip")?
            .set_default("recording.bind_ip", "127.0.0.1")?
            .set_default("recording.port_min", 50000)?
            .set_default("recording.port_max", 50999)?
            .set_default("recording.s3_bucket", None::<String>)?
            .set_default("recording.s3_prefix", "recordings")?
            .set_default("recording.s3_sse", None::<String>)?
            .set_default("aws.region", None::<String>)?
            .build()?;

        config.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::load().expect("Failed to load default settings")
    }
}
