use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

/// Server configuration, read from the environment with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub jwt_secret: Vec<u8>,
    pub max_players: i32,
    pub register_timeout: Duration,
    pub websocket_read_limit: usize,
    pub rate_limit: usize,
    pub allowed_origins: Vec<String>,
    pub quiz_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: "0.0.0.0:8080".parse().expect("static addr"),
            jwt_secret: Vec::new(),
            max_players: 25,
            register_timeout: Duration::from_secs(15 * 60),
            websocket_read_limit: 512,
            rate_limit: 30,
            allowed_origins: vec!["*".to_string()],
            quiz_dir: PathBuf::from("./quizzes"),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_default().into_bytes();
        if jwt_secret.is_empty() {
            warn!("JWT_SECRET not set, lobby tokens are signed with an id-derived key only");
        }

        Config {
            addr: parse_var("QUIZPARTY_ADDR", defaults.addr),
            jwt_secret,
            max_players: parse_var("LOBBY_MAX_PLAYERS", defaults.max_players),
            register_timeout: Duration::from_secs(parse_var(
                "LOBBY_REGISTER_TIMEOUT_SECS",
                defaults.register_timeout.as_secs(),
            )),
            websocket_read_limit: parse_var(
                "WEBSOCKET_READ_LIMIT",
                defaults.websocket_read_limit,
            ),
            rate_limit: parse_var("REQUESTS_RATE_LIMIT", defaults.rate_limit),
            allowed_origins: parse_origins(
                std::env::var("ALLOWED_ORIGINS").unwrap_or_else(|_| "*".to_string()),
            ),
            quiz_dir: PathBuf::from(
                std::env::var("QUIZ_DIR").unwrap_or_else(|_| "./quizzes".to_string()),
            ),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("invalid value for {}: {:?}, using default", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_origins(raw: String) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
