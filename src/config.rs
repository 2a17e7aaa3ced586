use std::collections::HashMap;

use envconfig::Envconfig;
use log::debug;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "SERVER_HOST", default = "127.0.0.1")]
    pub server_host: String,

    #[envconfig(from = "SERVER_PORT", default = "8080")]
    pub server_port: u16,

    /// Which store/backend pair to wire at startup: `local` or `postgres`.
    #[envconfig(from = "BACKEND", default = "local")]
    pub backend: String,
}

impl Config {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "Config loaded: server_host={}, server_port={}, backend={}",
            config.server_host, config.server_port, config.backend
        );
        Ok(config)
    }
}

#[derive(Envconfig, Clone)]
pub struct PostgresConfig {
    #[envconfig(from = "POSTGRES_USER", default = "postgres")]
    pub user: String,
    #[envconfig(from = "POSTGRES_PASSWORD", default = "postgres")]
    pub password: String,
    #[envconfig(from = "POSTGRES_HOST", default = "localhost:5432")]
    pub host: String,
    #[envconfig(from = "POSTGRES_DB", default = "main")]
    pub dbname: String,
}

impl PostgresConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "PostgresConfig loaded: user={}, host={}, dbname={}",
            config.user, config.host, config.dbname
        );
        Ok(config)
    }

    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}/{}",
            self.user, self.password, self.host, self.dbname
        )
    }
}

/// Bearer tokens accepted by the API, as `principal,token` pairs separated
/// by semicolons. Static credential table, same shape a reverse proxy would
/// hand us.
#[derive(Envconfig)]
pub struct AuthConfig {
    #[envconfig(from = "API_TOKENS", default = "admin,secret;dashboard,dashboard-token")]
    pub principal_token_pairs: String,
}

impl AuthConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!("AuthConfig loaded: {} token pair(s)", config.pairs().len());
        Ok(config)
    }

    /// Token -> principal.
    pub fn pairs(&self) -> HashMap<String, String> {
        self.principal_token_pairs
            .split(';')
            .filter_map(|pair| {
                let parts: Vec<&str> = pair.split(',').collect();
                if parts.len() == 2 {
                    Some((parts[1].trim().to_string(), parts[0].trim().to_string()))
                } else {
                    None
                }
            })
            .collect()
    }
}
