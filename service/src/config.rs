use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// A list of full CORS origin URLs that allowed to receive server responses.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "http://localhost:3000,https://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// The shared HS256 secret used to validate bearer tokens presented in `auth` frames.
    /// When unset every handshake is rejected.
    #[arg(long, env, hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Capacity of each connection's outbound queue. A connection whose queue
    /// fills up is disconnected.
    #[arg(long, env, default_value_t = 256)]
    pub ws_outbound_queue_capacity: usize,

    /// Seconds between server-initiated heartbeat pings
    #[arg(long, env, default_value_t = 54)]
    pub ws_heartbeat_interval_secs: u64,

    /// Seconds of inbound silence after which a connection is considered dead
    #[arg(long, env, default_value_t = 60)]
    pub ws_pong_timeout_secs: u64,

    /// Seconds allowed for a single frame write before the connection is dropped
    #[arg(long, env, default_value_t = 10)]
    pub ws_write_timeout_secs: u64,

    /// Largest inbound text frame, in bytes, accepted from a client
    #[arg(long, env, default_value_t = 16384)]
    pub ws_max_frame_bytes: usize,

    /// Failed `auth` attempts tolerated on one socket before it is closed
    #[arg(long, env, default_value_t = 3)]
    pub ws_max_auth_attempts: u32,

    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn jwt_secret(&self) -> Option<String> {
        self.jwt_secret.clone()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.ws_heartbeat_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_pong_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_write_timeout_secs)
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }
}
