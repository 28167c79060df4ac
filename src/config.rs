use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Built-in fallbacks for the defaults document.
const BUILTIN_ICHBIN_ENABLED: bool = false;
const BUILTIN_ICHBIN_WAITING_TIME: Duration = Duration::from_secs(3 * 24 * 3600);

const DEFAULT_COMMAND_PREFIX: &str = "/wg_";
const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 3600;
const DEFAULT_PRUNE_RETENTION_DAYS: i64 = 14;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub defaults: DefaultSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
    pub admin_user_ids: Option<Vec<u64>>,
    pub command_prefix: Option<String>,
    pub prune_interval_secs: Option<u64>,
    pub prune_retention_days: Option<i64>,
}

impl RuntimeConfig {
    pub fn command_prefix(&self) -> String {
        self.command_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_COMMAND_PREFIX.to_string())
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(
            self.prune_interval_secs
                .unwrap_or(DEFAULT_PRUNE_INTERVAL_SECS),
        )
    }

    pub fn prune_retention_days(&self) -> i64 {
        self.prune_retention_days
            .unwrap_or(DEFAULT_PRUNE_RETENTION_DAYS)
    }
}

/// The defaults document. Exactly two fields are recognized; anything else
/// fails the startup configuration check. Missing fields fall back to the
/// built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultSettings {
    pub ichbin_enabled: Option<bool>,
    pub ichbin_waiting_time: Option<String>,
}

/// Process-wide default policy with all fallbacks applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDefaults {
    pub ichbin_enabled: bool,
    pub ichbin_waiting_time: Duration,
}

impl DefaultSettings {
    pub fn resolve(&self) -> Result<ResolvedDefaults> {
        let ichbin_waiting_time = match &self.ichbin_waiting_time {
            None => BUILTIN_ICHBIN_WAITING_TIME,
            Some(raw) => parse_iso8601_duration(raw).ok_or_else(|| {
                Error::config(format!(
                    "ichbin_waiting_time {:?} is not a valid ISO-8601 duration",
                    raw
                ))
            })?,
        };
        if ichbin_waiting_time.is_zero() {
            return Err(Error::config("ichbin_waiting_time must not be zero"));
        }
        Ok(ResolvedDefaults {
            ichbin_enabled: self.ichbin_enabled.unwrap_or(BUILTIN_ICHBIN_ENABLED),
            ichbin_waiting_time,
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("read config {}: {}", path.display(), e)))?;
    let cfg: Config = serde_yaml::from_str(&text)
        .map_err(|e| Error::config(format!("parse config {}: {}", path.display(), e)))?;
    validate_config(&cfg)?;
    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    cfg.defaults.resolve()?;
    if let Some(secs) = cfg.runtime.prune_interval_secs {
        if secs == 0 {
            return Err(Error::config("prune_interval_secs must be > 0"));
        }
    }
    if let Some(days) = cfg.runtime.prune_retention_days {
        if days <= 0 {
            return Err(Error::config("prune_retention_days must be > 0"));
        }
    }
    if let Some(prefix) = &cfg.runtime.command_prefix {
        if prefix.is_empty() {
            return Err(Error::config("command_prefix must not be empty"));
        }
    }
    Ok(())
}

/// Parses a subset of ISO-8601 durations: `P[nW][nD][T[nH][nM][nS]]` with
/// non-negative integer components, e.g. `PT30S`, `P3D`, `P1DT12H`.
pub fn parse_iso8601_duration(s: &str) -> Option<Duration> {
    let rest = s.strip_prefix('P')?;
    if rest.is_empty() {
        return None;
    }
    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => {
            if time.is_empty() {
                return None;
            }
            (date, Some(time))
        }
        None => (rest, None),
    };

    let mut secs: u64 = 0;
    let mut seen = false;

    let mut eat = |part: &str, units: &[(char, u64)]| -> Option<()> {
        let mut digits = String::new();
        let mut unit_pos = 0;
        for c in part.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let pos = units[unit_pos..].iter().position(|(u, _)| *u == c)?;
            let (_, factor) = units[unit_pos + pos];
            // Units must appear at most once, in declaration order.
            unit_pos += pos + 1;
            if digits.is_empty() {
                return None;
            }
            let value: u64 = digits.parse().ok()?;
            secs = secs.checked_add(value.checked_mul(factor)?)?;
            digits.clear();
            seen = true;
        }
        if digits.is_empty() {
            Some(())
        } else {
            None
        }
    };

    eat(date_part, &[('W', 7 * 86_400), ('D', 86_400)])?;
    if let Some(time_part) = time_part {
        eat(time_part, &[('H', 3600), ('M', 60), ('S', 1)])?;
    }
    if !seen {
        return None;
    }
    Some(Duration::from_secs(secs))
}

pub fn format_iso8601_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    if secs == 0 {
        return "PT0S".to_string();
    }
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{}D", days));
    }
    if hours > 0 || minutes > 0 || secs > 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{}H", hours));
        }
        if minutes > 0 {
            out.push_str(&format!("{}M", minutes));
        }
        if secs > 0 {
            out.push_str(&format!("{}S", secs));
        }
    }
    out
}
