//! Runtime configuration for the wormhole core.
//!
//! Resolution order: defaults, then a TOML file (`load`), then environment
//! overrides (`apply_env`).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{WormholeError, WormholeResult};
use crate::lang::lexer::KEYWORDS;
use crate::retry::BackoffPolicy;
use crate::validator::{FORBIDDEN_OPERATIONS, HOST_PRIMITIVES};

/// Name the bridge entry point is bound under when nothing else is configured.
pub const DEFAULT_BRIDGE_BINDING: &str = "query";

/// Execution limits for one sandboxed invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Evaluation steps (statements, expressions, loop iterations) per call.
    pub max_steps: u64,
    /// Nested function calls, including the entry point.
    pub max_call_depth: usize,
    /// Wall-clock budget for a single invocation (milliseconds).
    pub timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            max_call_depth: 64,
            timeout_ms: 30_000,
        }
    }
}

/// Defaults for [`crate::retry::RetryContext`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryDefaults {
    /// Replays after the first attempt (0 = run once).
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WormholeConfig {
    /// Name the sandbox binds the bridge entry point under.
    pub bridge_binding: String,
    /// Principals allowed to write the policy table and delete cache rows.
    pub admin_principals: Vec<String>,
    pub sandbox: SandboxConfig,
    pub retry: RetryDefaults,
}

impl Default for WormholeConfig {
    fn default() -> Self {
        Self {
            bridge_binding: DEFAULT_BRIDGE_BINDING.to_string(),
            admin_principals: Vec::new(),
            sandbox: SandboxConfig::default(),
            retry: RetryDefaults::default(),
        }
    }
}

impl WormholeConfig {
    pub fn from_toml_str(text: &str) -> WormholeResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| WormholeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file.
    pub fn load(path: impl AsRef<Path>) -> WormholeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| WormholeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> WormholeResult<Self> {
        Self::default().apply_env()
    }

    /// Apply environment overrides:
    /// - WORMHOLE_BRIDGE_BINDING
    /// - WORMHOLE_ADMINS (comma separated)
    /// - WORMHOLE_MAX_STEPS
    /// - WORMHOLE_TIMEOUT_MS
    /// - WORMHOLE_MAX_RETRIES
    pub fn apply_env(mut self) -> WormholeResult<Self> {
        if let Some(binding) = env_var("WORMHOLE_BRIDGE_BINDING") {
            self.bridge_binding = binding;
        }
        if let Some(admins) = env_var("WORMHOLE_ADMINS") {
            self.admin_principals = admins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(raw) = env_var("WORMHOLE_MAX_STEPS") {
            self.sandbox.max_steps = parse_env("WORMHOLE_MAX_STEPS", &raw)?;
        }
        if let Some(raw) = env_var("WORMHOLE_TIMEOUT_MS") {
            self.sandbox.timeout_ms = parse_env("WORMHOLE_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = env_var("WORMHOLE_MAX_RETRIES") {
            self.retry.max_retries = parse_env("WORMHOLE_MAX_RETRIES", &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_admin(mut self, principal: impl Into<String>) -> Self {
        self.admin_principals.push(principal.into());
        self
    }

    pub fn is_admin(&self, principal: &str) -> bool {
        self.admin_principals.iter().any(|p| p == principal)
    }

    /// Reject settings that would make the sandbox unusable or unsafe.
    pub fn validate(&self) -> WormholeResult<()> {
        let binding = self.bridge_binding.as_str();
        let is_identifier = binding
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && binding.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !is_identifier || KEYWORDS.contains(&binding) {
            return Err(WormholeError::Config(format!(
                "bridge_binding must be an identifier, got {binding:?}"
            )));
        }
        if FORBIDDEN_OPERATIONS.contains(&binding) || HOST_PRIMITIVES.contains(&binding) {
            return Err(WormholeError::Config(format!(
                "bridge_binding {binding:?} collides with a denied name"
            )));
        }
        if self.sandbox.max_steps == 0 || self.sandbox.max_call_depth == 0 {
            return Err(WormholeError::Config(
                "sandbox limits must be greater than zero".into(),
            ));
        }
        if self.retry.backoff.multiplier == 0 {
            return Err(WormholeError::Config(
                "retry.backoff.multiplier must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> WormholeResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| WormholeError::Config(format!("{key} is not a number: {raw}")))
}
