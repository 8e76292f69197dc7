//! Application configuration.
//!
//! Built once from the environment at startup and threaded into components;
//! nothing reads env vars after boot and there is no module-level mutable
//! state.

use anyhow::{Context, Result};

use crate::orchestrator::RunDefaults;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub ingest_bind_addr: String,
    pub orchestrator_bind_addr: String,
    pub hash_mod_default: u32,
    pub max_attempts_default: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "./riskrun.db".to_string());
        let ingest_bind_addr =
            std::env::var("INGEST_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let orchestrator_bind_addr = std::env::var("ORCHESTRATOR_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let hash_mod_default = parse_env_u32("RUN_TASK_HASH_MOD", 1)?;
        if hash_mod_default < 1 {
            anyhow::bail!("RUN_TASK_HASH_MOD must be >= 1");
        }
        let max_attempts_default = parse_env_u32("RUN_TASK_MAX_ATTEMPTS", 3)?;
        if max_attempts_default < 1 {
            anyhow::bail!("RUN_TASK_MAX_ATTEMPTS must be >= 1");
        }

        Ok(Self {
            database_url,
            ingest_bind_addr,
            orchestrator_bind_addr,
            hash_mod_default,
            max_attempts_default,
        })
    }

    pub fn run_defaults(&self) -> RunDefaults {
        RunDefaults { hash_mod: self.hash_mod_default, max_attempts: self.max_attempts_default }
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32> {
    match std::env::var(name) {
        Ok(value) => value.parse().with_context(|| format!("{} must be an integer", name)),
        Err(_) => Ok(default),
    }
}
