//! Layered configuration, env-var driven.
//!
//! Priority is env var > built-in default (there is no file-based layer —
//! unlike the daemon's `config.toml`, nothing here needs operator editing
//! outside of env vars). Unlike the daemon's silent-fallback-on-parse-failure
//! behavior, a non-positive numeric env var here is a hard startup error.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

const DEFAULT_DB_PATH: &str = "./data/queue.sqlite";
const DEFAULT_LEASE_TTL_MS: u64 = 120_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_API_PORT: u16 = 7070;
const DEFAULT_WORKER_API_BASE_URL: &str = "http://localhost:7070";
const DEFAULT_WORKER_POLL_MS: u64 = 2_000;
const DEFAULT_WORKER_PHASE_TIMEOUT_MS: u64 = 600_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub lease_ttl_ms: u64,
    pub max_attempts: u32,
    pub api_port: u16,
    pub worker_api_base_url: String,
    pub worker_poll_ms: u64,
    pub worker_lease_ttl_ms: u64,
    pub worker_phase_timeout_ms: u64,
}

fn positive_env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => {
            let value: i64 = raw
                .parse()
                .with_context(|| format!("{name} must be an integer, got {raw:?}"))?;
            if value <= 0 {
                bail!("{name} must be a positive integer, got {value}");
            }
            Ok(value as u64)
        }
        Err(_) => Ok(default),
    }
}

fn positive_env_u32(name: &str, default: u32) -> Result<u32> {
    Ok(positive_env_u64(name, default as u64)? as u32)
}

fn positive_env_u16(name: &str, default: u16) -> Result<u16> {
    let v = positive_env_u64(name, default as u64)?;
    if v > u16::MAX as u64 {
        bail!("{name} must fit in a u16, got {v}");
    }
    Ok(v as u16)
}

impl Config {
    /// Build config from environment variables, failing fast on any
    /// malformed or non-positive numeric override.
    pub fn from_env() -> Result<Self> {
        let db_path = std::env::var("QUEUE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH));

        Ok(Self {
            db_path,
            lease_ttl_ms: positive_env_u64("QUEUE_LEASE_TTL_MS", DEFAULT_LEASE_TTL_MS)?,
            max_attempts: positive_env_u32("QUEUE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            api_port: positive_env_u16("QUEUE_API_PORT", DEFAULT_API_PORT)?,
            worker_api_base_url: std::env::var("WORKER_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_WORKER_API_BASE_URL.to_string()),
            worker_poll_ms: positive_env_u64("WORKER_POLL_MS", DEFAULT_WORKER_POLL_MS)?,
            worker_lease_ttl_ms: positive_env_u64("WORKER_LEASE_TTL_MS", DEFAULT_LEASE_TTL_MS)?,
            worker_phase_timeout_ms: positive_env_u64(
                "WORKER_PHASE_TIMEOUT_MS",
                DEFAULT_WORKER_PHASE_TIMEOUT_MS,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_env() {
        // Not asserting on process-wide env state here (tests may run
        // concurrently); just check the pure parsing helpers.
        assert_eq!(positive_env_u64("QUEUE_DOES_NOT_EXIST", 42).unwrap(), 42);
    }

    #[test]
    fn rejects_non_positive_numeric_override() {
        std::env::set_var("TASKLOOM_TEST_ZERO", "0");
        let err = positive_env_u64("TASKLOOM_TEST_ZERO", 1).unwrap_err();
        assert!(err.to_string().contains("positive"));
        std::env::remove_var("TASKLOOM_TEST_ZERO");
    }

    #[test]
    fn rejects_non_integer_override() {
        std::env::set_var("TASKLOOM_TEST_NAN", "not-a-number");
        let err = positive_env_u64("TASKLOOM_TEST_NAN", 1).unwrap_err();
        assert!(err.to_string().contains("integer"));
        std::env::remove_var("TASKLOOM_TEST_NAN");
    }
}
