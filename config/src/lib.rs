//! Environment configuration, loaded once at process start.
//!
//! A minimal `.env` loader (existing environment always wins) plus typed
//! settings for the two processes: [`CallbackSettings`] for the gateway-side
//! shim and [`ControlPlaneSettings`] for the policy host.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// Default control-plane base URL when `CONTROL_PLANE_URL` is unset.
pub const DEFAULT_CONTROL_PLANE_URL: &str = "http://control-plane:8081";

/// Bounds outside which `CONTROL_PLANE_STREAM_TIMEOUT` draws a warning.
const STREAM_TIMEOUT_MIN_SECS: f64 = 1.0;
const STREAM_TIMEOUT_MAX_SECS: f64 = 600.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
    #[error("invalid policy options for '{name}': {source}")]
    PolicyOptions {
        name: String,
        source: serde_json::Error,
    },
}

/// Parses `.env` content: `KEY=VALUE` lines, `#` comments, optional quotes.
fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'');
        out.insert(key.to_string(), value.to_string());
    }
    out
}

/// Loads `.env` from `dir` (or the current directory) into the process
/// environment. Keys already present in the environment are left alone.
pub fn load_dotenv(dir: Option<&Path>) -> Result<(), ConfigError> {
    let dir = match dir.map(Path::to_path_buf).or_else(|| std::env::current_dir().ok()) {
        Some(d) => d,
        None => return Ok(()),
    };
    let path = dir.join(".env");
    if !path.is_file() {
        return Ok(());
    }
    let content = std::fs::read_to_string(&path).map_err(ConfigError::DotenvRead)?;
    for (key, value) in parse_dotenv(&content) {
        if std::env::var(&key).is_err() {
            std::env::set_var(&key, value);
        }
    }
    Ok(())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("{key}={raw} is not a valid value; using default");
            default
        }),
        Err(_) => default,
    }
}

/// Reference to the active policy: `name` or `name:{json options}`.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRef {
    pub name: String,
    pub options: serde_json::Value,
}

impl PolicyRef {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let (name, options) = match raw.split_once(':') {
            Some((name, opts)) => {
                let options =
                    serde_json::from_str(opts).map_err(|source| ConfigError::PolicyOptions {
                        name: name.to_string(),
                        source,
                    })?;
                (name, options)
            }
            None => (raw, serde_json::Value::Null),
        };
        Ok(Self {
            name: name.trim().to_string(),
            options,
        })
    }
}

/// Settings for the gateway-side callback shim.
#[derive(Debug, Clone)]
pub struct CallbackSettings {
    /// Base URL for HTTP hooks and the stream WebSocket.
    pub control_plane_url: String,
    /// Per-stream total budget (`CONTROL_PLANE_STREAM_TIMEOUT`).
    pub stream_timeout: Duration,
    /// Per-chunk reply budget.
    pub chunk_timeout: Duration,
    /// HTTP hook POST budget.
    pub hook_timeout: Duration,
}

impl CallbackSettings {
    pub fn from_env() -> Self {
        let stream_timeout_secs: f64 = env_parse("CONTROL_PLANE_STREAM_TIMEOUT", 30.0);
        if stream_timeout_secs < STREAM_TIMEOUT_MIN_SECS {
            tracing::warn!(
                "CONTROL_PLANE_STREAM_TIMEOUT={stream_timeout_secs} is below the {STREAM_TIMEOUT_MIN_SECS}s minimum; streams may time out prematurely"
            );
        } else if stream_timeout_secs > STREAM_TIMEOUT_MAX_SECS {
            tracing::warn!(
                "CONTROL_PLANE_STREAM_TIMEOUT={stream_timeout_secs} exceeds the {STREAM_TIMEOUT_MAX_SECS}s maximum; long streams may hold resources"
            );
        }
        Self {
            control_plane_url: env_or("CONTROL_PLANE_URL", DEFAULT_CONTROL_PLANE_URL),
            stream_timeout: Duration::from_secs_f64(stream_timeout_secs.max(0.0)),
            chunk_timeout: Duration::from_secs_f64(env_parse("CONTROL_PLANE_CHUNK_TIMEOUT", 5.0)),
            hook_timeout: Duration::from_secs_f64(env_parse("CONTROL_PLANE_HOOK_TIMEOUT", 10.0)),
        }
    }

    /// WebSocket URL for a call's stream channel.
    pub fn stream_url(&self, call_id: &str) -> String {
        let ws_base = if let Some(rest) = self.control_plane_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.control_plane_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.control_plane_url.clone()
        };
        format!("{}/api/streams/{call_id}", ws_base.trim_end_matches('/'))
    }
}

/// Settings for the control-plane process.
#[derive(Debug, Clone)]
pub struct ControlPlaneSettings {
    pub bind_addr: String,
    pub policy: PolicyRef,
    /// Sliding-window limit for the SSE endpoints: events per window.
    pub sse_rate_limit_events: usize,
    pub sse_rate_limit_window: Duration,
}

impl ControlPlaneSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let policy = PolicyRef::parse(&env_or("SLUICE_POLICY", "noop"))?;
        Ok(Self {
            bind_addr: env_or("CONTROL_PLANE_BIND", "0.0.0.0:8081"),
            policy,
            sse_rate_limit_events: env_parse("SSE_RATE_LIMIT_EVENTS", 10usize),
            sse_rate_limit_window: Duration::from_secs_f64(env_parse(
                "SSE_RATE_LIMIT_WINDOW_SECONDS",
                60.0,
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dotenv_basics() {
        let m = parse_dotenv("# comment\nA=1\nB=\"two\"\nbroken line\n");
        assert_eq!(m.get("A").map(String::as_str), Some("1"));
        assert_eq!(m.get("B").map(String::as_str), Some("two"));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn load_dotenv_does_not_override_existing_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "SLUICE_TEST_EXISTING=from_file\n").unwrap();
        std::env::set_var("SLUICE_TEST_EXISTING", "from_env");
        load_dotenv(Some(dir.path())).unwrap();
        assert_eq!(
            std::env::var("SLUICE_TEST_EXISTING").as_deref(),
            Ok("from_env")
        );
        std::env::remove_var("SLUICE_TEST_EXISTING");
    }

    #[test]
    fn policy_ref_without_options() {
        let r = PolicyRef::parse("noop").unwrap();
        assert_eq!(r.name, "noop");
        assert!(r.options.is_null());
    }

    #[test]
    fn policy_ref_with_options() {
        let r = PolicyRef::parse("tool_call_judge:{\"probability_threshold\":0.8}").unwrap();
        assert_eq!(r.name, "tool_call_judge");
        assert_eq!(r.options["probability_threshold"], 0.8);
    }

    #[test]
    fn policy_ref_with_bad_options_errors() {
        assert!(PolicyRef::parse("judge:{not json}").is_err());
    }

    #[test]
    fn stream_url_swaps_scheme() {
        let settings = CallbackSettings {
            control_plane_url: "http://cp:8081".into(),
            stream_timeout: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(5),
            hook_timeout: Duration::from_secs(10),
        };
        assert_eq!(settings.stream_url("abc"), "ws://cp:8081/api/streams/abc");
    }
}
