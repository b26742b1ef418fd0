use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::store::CACHE_TTL_SECS;

pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub cache_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let _ = dotenv().is_ok();

        let port = env::var("PORT")
            .expect("PORT missing, it is required")
            .parse()
            .expect("PORT must be a valid u16 number");

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL missing, it is required");

        let cache_ttl = env::var("FLAG_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(CACHE_TTL_SECS));

        Self {
            port,
            database_url,
            cache_ttl,
        }
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}
