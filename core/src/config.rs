//! Client configuration.
//!
//! Read from the environment by default:
//!
//! | variable                | required | default |
//! |-------------------------|----------|---------|
//! | `TASKFLOW_URL`          | yes      |         |
//! | `TASKFLOW_ANON_KEY`     | yes      |         |
//! | `TASKFLOW_TIMEOUT_SECS` | no       | 30      |

use std::time::Duration;

use crate::error::ApiError;

pub const URL_VAR: &str = "TASKFLOW_URL";
pub const ANON_KEY_VAR: &str = "TASKFLOW_ANON_KEY";
pub const TIMEOUT_VAR: &str = "TASKFLOW_TIMEOUT_SECS";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub anon_key: String,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: &str, anon_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ApiError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let base_url = get(URL_VAR).ok_or_else(|| ApiError::Config(format!("{URL_VAR} is not set")))?;
        let anon_key =
            get(ANON_KEY_VAR).ok_or_else(|| ApiError::Config(format!("{ANON_KEY_VAR} is not set")))?;
        let timeout = match get(TIMEOUT_VAR) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| ApiError::Config(format!("{TIMEOUT_VAR}={raw}: {e}")))?,
            None => DEFAULT_TIMEOUT,
        };

        Ok(Self::new(&base_url, &anon_key).with_timeout(timeout))
    }
}
