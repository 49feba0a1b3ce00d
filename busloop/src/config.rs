//! Connection settings.

use std::env;
use std::fs;
use std::path::Path;

use crate::bus::BusScope;
use crate::error::{Error, ErrorKind, Result};

pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 25_000;

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub scope: BusScope,
    /// Well-known name to claim while opening. `None` or empty claims nothing.
    pub name: Option<String>,
    /// Bound for the deferred reply queue; unbounded when `None`.
    pub reply_queue_limit: Option<usize>,
    pub call_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            scope: BusScope::default(),
            name: None,
            reply_queue_limit: None,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }
}

fn config_error<S: Into<String>>(message: S) -> Error {
    Error::with_message(ErrorKind::Config, libc::EINVAL, message)
}

impl Settings {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| config_error(e.to_string()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text =
            fs::read_to_string(path.as_ref()).map_err(|e| Error::from_io(ErrorKind::Config, &e))?;
        Settings::from_json(&text)
    }

    /// Defaults overridden by `BUSLOOP_SCOPE`, `BUSLOOP_NAME`,
    /// `BUSLOOP_REPLY_QUEUE_LIMIT` and `BUSLOOP_CALL_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        Settings::from_vars(|key| env::var(key).ok())
    }

    fn from_vars<F: Fn(&str) -> Option<String>>(var: F) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(scope) = var("BUSLOOP_SCOPE") {
            settings.scope = scope
                .parse()
                .map_err(|_| config_error(format!("unknown bus scope '{}'", scope)))?;
        }
        if let Some(name) = var("BUSLOOP_NAME") {
            settings.name = Some(name).filter(|n| !n.is_empty());
        }
        if let Some(limit) = var("BUSLOOP_REPLY_QUEUE_LIMIT") {
            settings.reply_queue_limit = Some(
                limit
                    .parse()
                    .map_err(|_| config_error(format!("bad reply queue limit '{}'", limit)))?,
            );
        }
        if let Some(ms) = var("BUSLOOP_CALL_TIMEOUT_MS") {
            settings.call_timeout_ms = ms
                .parse()
                .map_err(|_| config_error(format!("bad call timeout '{}'", ms)))?;
        }

        Ok(settings)
    }

    pub(crate) fn call_timeout_usec(&self) -> u64 {
        self.call_timeout_ms.saturating_mul(1000)
    }
}
