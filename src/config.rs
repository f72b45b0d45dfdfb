use crate::{
    error::{Error, Result},
    monitor::CommitPolicy,
    seqno::Seqno,
};
use std::time::Duration;

/// Parameter names accepted by [`Config::set`].
pub mod params {
    /// Log every certification conflict with keys and seqnos.
    pub const CERT_LOG_CONFLICTS: &str = "cert.log_conflicts";
    /// Bound parallel apply by the certification interval instead of the
    /// computed dependencies.
    pub const CERT_OPTIMISTIC_PA: &str = "cert.optimistic_pa";
    /// Commit monitor policy, numeric 0..=3.
    pub const REPL_COMMIT_ORDER: &str = "repl.commit_order";
    /// Maximum accepted write-set size in bytes.
    pub const REPL_MAX_WS_SIZE: &str = "repl.max_ws_size";
    /// Causal read wait bound, seconds (fractions allowed).
    pub const REPL_CAUSAL_READ_TIMEOUT: &str = "repl.causal_read_timeout";
    /// Upper bound on the certification-imposed apply window.
    pub const REPL_PA_RANGE: &str = "repl.pa_range";
}

/// Replication engine options.
///
/// Construct with [`Config::default`] and override fields directly, or
/// feed provider-style `key=value` strings through [`Config::set`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Log every certification failure with the conflicting keys.
    pub log_conflicts: bool,
    /// Allow the apply window to follow computed dependencies only.
    pub optimistic_pa: bool,
    /// Commit ordering policy.
    pub commit_order: CommitPolicy,
    /// Write sets above this size are rejected at replicate time.
    pub max_ws_size: usize,
    /// Bound on causal-read waits.
    pub causal_read_timeout: Duration,
    /// No admitted write set may depend further back than this many
    /// seqnos; keeps the apply window inside the monitor ring.
    pub pa_range: Seqno,
    /// Apply monitor window size (power of two).
    pub apply_window: usize,
    /// Local and commit monitor window size (power of two).
    pub monitor_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_conflicts: false,
            optimistic_pa: true,
            commit_order: CommitPolicy::NoOooc,
            max_ws_size: 2 << 30,
            causal_read_timeout: Duration::from_secs(30),
            pa_range: 1 << 13,
            apply_window: 1 << 14,
            monitor_window: 1 << 16,
        }
    }
}

impl Config {
    /// Applies a provider-style string parameter.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            params::CERT_LOG_CONFLICTS => {
                self.log_conflicts = parse_bool(params::CERT_LOG_CONFLICTS, value)?;
            }
            params::CERT_OPTIMISTIC_PA => {
                self.optimistic_pa = parse_bool(params::CERT_OPTIMISTIC_PA, value)?;
            }
            params::REPL_COMMIT_ORDER => {
                let n: u8 = value.parse().map_err(|_| Error::InvalidParam {
                    key: params::REPL_COMMIT_ORDER,
                    value: value.into(),
                })?;
                self.commit_order = CommitPolicy::from_number(n).ok_or(Error::InvalidParam {
                    key: params::REPL_COMMIT_ORDER,
                    value: value.into(),
                })?;
            }
            params::REPL_MAX_WS_SIZE => {
                self.max_ws_size = value.parse().map_err(|_| Error::InvalidParam {
                    key: params::REPL_MAX_WS_SIZE,
                    value: value.into(),
                })?;
            }
            params::REPL_CAUSAL_READ_TIMEOUT => {
                let secs: f64 = value.parse().map_err(|_| Error::InvalidParam {
                    key: params::REPL_CAUSAL_READ_TIMEOUT,
                    value: value.into(),
                })?;
                if !secs.is_finite() || secs < 0.0 {
                    return Err(Error::InvalidParam {
                        key: params::REPL_CAUSAL_READ_TIMEOUT,
                        value: value.into(),
                    });
                }
                self.causal_read_timeout = Duration::from_secs_f64(secs);
            }
            params::REPL_PA_RANGE => {
                let range: Seqno = value.parse().map_err(|_| Error::InvalidParam {
                    key: params::REPL_PA_RANGE,
                    value: value.into(),
                })?;
                if range < 0 {
                    return Err(Error::InvalidParam {
                        key: params::REPL_PA_RANGE,
                        value: value.into(),
                    });
                }
                self.pa_range = range;
            }
            _ => return Err(Error::UnknownParam(key.into())),
        }
        Ok(())
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool> {
    match value {
        "yes" | "true" | "1" | "on" => Ok(true),
        "no" | "false" | "0" | "off" => Ok(false),
        _ => Err(Error::InvalidParam { key, value: value.into() }),
    }
}
