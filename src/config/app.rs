//! Main application configuration
//!
//! This module defines the primary configuration structures for the dispatch
//! service, including environment variable and TOML file loading and validation.

use crate::types::{Principal, PrincipalKind};
use crate::utils::seconds_to_duration;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub realtime: RealtimeSettings,
    pub matching: MatchingSettings,
    pub lifecycle: LifecycleSettings,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Service name for logging and metrics
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Port for the realtime WebSocket endpoint
    pub http_port: u16,
    /// Port for health check and metrics endpoints
    pub metrics_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
}

/// Connection hub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    /// Bounded outbound queue size per connection
    pub outbound_queue_capacity: usize,
    /// Interval between keepalive pings
    pub keepalive_interval_seconds: u64,
    /// Static upgrade tokens, keyed by token
    pub auth_tokens: HashMap<String, TokenGrant>,
}

/// Identity granted by a static upgrade token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub user_id: String,
    pub kind: PrincipalKind,
}

impl From<TokenGrant> for Principal {
    fn from(grant: TokenGrant) -> Self {
        Principal {
            user_id: grant.user_id,
            kind: grant.kind,
        }
    }
}

/// Geo matcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    /// Radius used when a request does not specify one
    pub default_radius_km: f64,
    /// Largest radius a request may ask for
    pub max_radius_km: f64,
    /// Maximum age of a worker's location fix
    pub location_freshness_seconds: u64,
    /// Assumed travel speed for ETA estimates
    pub average_speed_kmh: f64,
}

/// Request lifecycle and sweeper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// How long a broadcast request stays open for acceptance
    pub broadcast_deadline_seconds: u64,
    /// Interval between expiry sweeps
    pub sweep_interval_seconds: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "service-dispatch".to_string(),
            log_level: "info".to_string(),
            http_port: 8000,
            metrics_port: 9090,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 64,
            keepalive_interval_seconds: 30,
            auth_tokens: HashMap::new(),
        }
    }
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            default_radius_km: 10.0,
            max_radius_km: 50.0,
            location_freshness_seconds: 900, // 15 minutes
            average_speed_kmh: 30.0,
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            broadcast_deadline_seconds: 180, // 3 minutes
            sweep_interval_seconds: 30,
        }
    }
}

/// Upper bound for the broadcast deadline and the location freshness window
pub const MAX_WINDOW_SECONDS: u64 = 86_400;

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("Invalid {} value: {}", name, value))
}

/// Parse `token:user_id:kind` triples separated by commas
fn parse_token_table(raw: &str) -> Result<HashMap<String, TokenGrant>> {
    let mut tokens = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 3 {
            return Err(anyhow!("Invalid AUTH_TOKENS entry: {}", entry));
        }
        let kind = match parts[2].to_lowercase().as_str() {
            "customer" => PrincipalKind::Customer,
            "worker" => PrincipalKind::Worker,
            other => return Err(anyhow!("Invalid principal kind in AUTH_TOKENS: {}", other)),
        };
        tokens.insert(
            parts[0].to_string(),
            TokenGrant {
                user_id: parts[1].to_string(),
                kind,
            },
        );
    }
    Ok(tokens)
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        // Service settings
        if let Ok(name) = env::var("SERVICE_NAME") {
            self.service.name = name;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            self.service.log_level = log_level;
        }
        if let Ok(port) = env::var("HTTP_PORT") {
            self.service.http_port = parse_env("HTTP_PORT", &port)?;
        }
        if let Ok(port) = env::var("METRICS_PORT") {
            self.service.metrics_port = parse_env("METRICS_PORT", &port)?;
        }
        if let Ok(timeout) = env::var("SHUTDOWN_TIMEOUT_SECONDS") {
            self.service.shutdown_timeout_seconds =
                parse_env("SHUTDOWN_TIMEOUT_SECONDS", &timeout)?;
        }

        // Realtime settings
        if let Ok(capacity) = env::var("OUTBOUND_QUEUE_CAPACITY") {
            self.realtime.outbound_queue_capacity =
                parse_env("OUTBOUND_QUEUE_CAPACITY", &capacity)?;
        }
        if let Ok(keepalive) = env::var("KEEPALIVE_INTERVAL_SECONDS") {
            self.realtime.keepalive_interval_seconds =
                parse_env("KEEPALIVE_INTERVAL_SECONDS", &keepalive)?;
        }
        if let Ok(tokens) = env::var("AUTH_TOKENS") {
            self.realtime.auth_tokens.extend(parse_token_table(&tokens)?);
        }

        // Matching settings
        if let Ok(radius) = env::var("DEFAULT_RADIUS_KM") {
            self.matching.default_radius_km = parse_env("DEFAULT_RADIUS_KM", &radius)?;
        }
        if let Ok(radius) = env::var("MAX_RADIUS_KM") {
            self.matching.max_radius_km = parse_env("MAX_RADIUS_KM", &radius)?;
        }
        if let Ok(freshness) = env::var("LOCATION_FRESHNESS_SECONDS") {
            self.matching.location_freshness_seconds =
                parse_env("LOCATION_FRESHNESS_SECONDS", &freshness)?;
        }
        if let Ok(speed) = env::var("AVERAGE_SPEED_KMH") {
            self.matching.average_speed_kmh = parse_env("AVERAGE_SPEED_KMH", &speed)?;
        }

        // Lifecycle settings
        if let Ok(deadline) = env::var("BROADCAST_DEADLINE_SECONDS") {
            self.lifecycle.broadcast_deadline_seconds =
                parse_env("BROADCAST_DEADLINE_SECONDS", &deadline)?;
        }
        if let Ok(interval) = env::var("SWEEP_INTERVAL_SECONDS") {
            self.lifecycle.sweep_interval_seconds = parse_env("SWEEP_INTERVAL_SECONDS", &interval)?;
        }

        Ok(())
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_timeout_seconds)
    }

    /// Get keepalive interval as Duration
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.realtime.keepalive_interval_seconds)
    }

    /// Get sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lifecycle.sweep_interval_seconds)
    }

    /// Get broadcast deadline as a chrono Duration
    pub fn broadcast_deadline(&self) -> chrono::Duration {
        seconds_to_duration(self.lifecycle.broadcast_deadline_seconds)
    }
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    // Validate log level
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.service.log_level)),
    }

    // Validate ports
    if config.service.http_port == 0 {
        return Err(anyhow!("HTTP port cannot be 0"));
    }
    if config.service.metrics_port == 0 {
        return Err(anyhow!("Metrics port cannot be 0"));
    }
    if config.service.http_port == config.service.metrics_port {
        return Err(anyhow!("HTTP port and metrics port must differ"));
    }

    // Validate timeouts
    if config.service.shutdown_timeout_seconds == 0 {
        return Err(anyhow!("Shutdown timeout must be greater than 0"));
    }

    // Validate realtime settings
    if config.realtime.outbound_queue_capacity == 0 {
        return Err(anyhow!("Outbound queue capacity must be greater than 0"));
    }
    if config.realtime.keepalive_interval_seconds == 0 {
        return Err(anyhow!("Keepalive interval must be greater than 0"));
    }

    // Validate matching settings
    let matching = &config.matching;
    if !(matching.max_radius_km.is_finite() && matching.max_radius_km > 0.0) {
        return Err(anyhow!("Max radius must be positive"));
    }
    if !(matching.default_radius_km > 0.0 && matching.default_radius_km <= matching.max_radius_km)
    {
        return Err(anyhow!(
            "Default radius must be in (0, {}]",
            matching.max_radius_km
        ));
    }
    if matching.location_freshness_seconds == 0
        || matching.location_freshness_seconds > MAX_WINDOW_SECONDS
    {
        return Err(anyhow!(
            "Location freshness window must be in (0, {}] seconds",
            MAX_WINDOW_SECONDS
        ));
    }
    if !(matching.average_speed_kmh.is_finite() && matching.average_speed_kmh > 0.0) {
        return Err(anyhow!("Average speed must be positive"));
    }

    // Validate lifecycle settings
    if config.lifecycle.broadcast_deadline_seconds == 0
        || config.lifecycle.broadcast_deadline_seconds > MAX_WINDOW_SECONDS
    {
        return Err(anyhow!(
            "Broadcast deadline must be in (0, {}] seconds",
            MAX_WINDOW_SECONDS
        ));
    }
    if config.lifecycle.sweep_interval_seconds == 0 {
        return Err(anyhow!("Sweep interval must be greater than 0"));
    }

    Ok(())
}
