//! Runtime setting overrides.
//!
//! Admin commands of the form `set <key> <value> [--ttl <duration|max>]`
//! install process-local overrides that take precedence over file
//! configuration until their TTL expires. The supervisor resolves its
//! effective settings through [`RuntimeOverrides::apply`] on every
//! evaluation, so an override takes effect at the next tick without a
//! restart.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::RebuildingSettings;
use crate::error::{Result, StrandError};

/// Recognised override keys (dashed, as typed by operators).
pub const OVERRIDE_KEYS: [&str; 8] = [
    "enable-self-initiated-rebuilding",
    "disable-data-log-rebuilding",
    "self-initiated-rebuilding-grace-period",
    "max-node-rebuilding-percentage",
    "max-rebuilding-trigger-queue-size",
    "event-log-grace-period",
    "use-legacy-log-to-shard-mapping-in-rebuilding",
    "min-gossips-for-stable-state",
];

/// Time-to-live of an override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    For(Duration),
    Max,
}

#[derive(Debug, Clone)]
struct Override {
    value: String,
    expires_at: Option<Instant>,
}

/// The process-local override registry.
#[derive(Debug, Default)]
pub struct RuntimeOverrides {
    inner: Mutex<HashMap<String, Override>>,
}

impl RuntimeOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an override, validating key and value.
    pub fn set(&self, key: &str, value: &str, ttl: Ttl) -> Result<()> {
        if !OVERRIDE_KEYS.contains(&key) {
            return Err(StrandError::UnknownSetting(key.to_owned()));
        }
        // Reject unparseable values up front rather than at use time.
        apply_one(&mut RebuildingSettings::default(), key, value)?;

        let expires_at = match ttl {
            Ttl::For(d) => Some(Instant::now() + d),
            Ttl::Max => None,
        };
        info!(key, value, ?ttl, "runtime override set");
        self.inner.lock().insert(
            key.to_owned(),
            Override {
                value: value.to_owned(),
                expires_at,
            },
        );
        Ok(())
    }

    /// Drop an override.
    pub fn unset(&self, key: &str) {
        self.inner.lock().remove(key);
    }

    /// Current value of an override, pruning it if expired.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        match inner.get(key) {
            Some(o) if o.expires_at.map_or(true, |t| Instant::now() < t) => {
                Some(o.value.clone())
            }
            Some(_) => {
                inner.remove(key);
                None
            }
            None => None,
        }
    }

    /// Layer live overrides on top of `base`.
    pub fn apply(&self, base: &RebuildingSettings) -> RebuildingSettings {
        let mut effective = base.clone();
        for key in OVERRIDE_KEYS {
            if let Some(value) = self.get(key) {
                // Values were validated at set time.
                let _ = apply_one(&mut effective, key, &value);
            }
        }
        effective
    }

    /// Parse and execute a `set` command line.
    pub fn execute(&self, command: &str) -> Result<()> {
        let parsed = AdminCommand::parse(command)?;
        self.set(&parsed.key, &parsed.value, parsed.ttl)
    }
}

/// A parsed `set` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCommand {
    pub key: String,
    pub value: String,
    pub ttl: Ttl,
}

impl AdminCommand {
    /// Parse `set <key> <value> [--ttl <duration|max>]`.
    pub fn parse(command: &str) -> Result<Self> {
        let mut words = command.split_whitespace();
        let bad = |reason: &str| StrandError::InvalidConfig {
            field: "admin command".into(),
            reason: reason.into(),
        };
        if words.next() != Some("set") {
            return Err(bad("expected `set <key> <value> [--ttl <duration|max>]`"));
        }
        let key = words.next().ok_or_else(|| bad("missing key"))?.to_owned();
        let value = words.next().ok_or_else(|| bad("missing value"))?.to_owned();
        let ttl = match words.next() {
            None => Ttl::Max,
            Some("--ttl") => match words.next() {
                Some("max") => Ttl::Max,
                Some(spec) => Ttl::For(
                    humantime::parse_duration(spec)
                        .map_err(|e| bad(&format!("bad ttl `{spec}`: {e}")))?,
                ),
                None => return Err(bad("missing ttl value")),
            },
            Some(other) => return Err(bad(&format!("unexpected argument `{other}`"))),
        };
        if words.next().is_some() {
            return Err(bad("trailing arguments"));
        }
        Ok(Self { key, value, ttl })
    }
}

fn apply_one(settings: &mut RebuildingSettings, key: &str, value: &str) -> Result<()> {
    let bad = |e: String| StrandError::InvalidConfig {
        field: key.to_owned(),
        reason: e,
    };
    match key {
        "enable-self-initiated-rebuilding" => {
            settings.enable_self_initiated_rebuilding =
                value.parse().map_err(|_| bad("expected bool".into()))?;
        }
        "disable-data-log-rebuilding" => {
            settings.disable_data_log_rebuilding =
                value.parse().map_err(|_| bad("expected bool".into()))?;
        }
        "self-initiated-rebuilding-grace-period" => {
            settings.self_initiated_rebuilding_grace_period =
                humantime::parse_duration(value).map_err(|e| bad(e.to_string()))?;
        }
        "max-node-rebuilding-percentage" => {
            let pct: u8 = value.parse().map_err(|_| bad("expected 0..=100".into()))?;
            if pct > 100 {
                return Err(bad("expected 0..=100".into()));
            }
            settings.max_node_rebuilding_percentage = pct;
        }
        "max-rebuilding-trigger-queue-size" => {
            settings.max_rebuilding_trigger_queue_size =
                value.parse().map_err(|_| bad("expected integer".into()))?;
        }
        "event-log-grace-period" => {
            settings.event_log_grace_period =
                humantime::parse_duration(value).map_err(|e| bad(e.to_string()))?;
        }
        "use-legacy-log-to-shard-mapping-in-rebuilding" => {
            settings.use_legacy_log_to_shard_mapping_in_rebuilding =
                value.parse().map_err(|_| bad("expected bool".into()))?;
        }
        "min-gossips-for-stable-state" => {
            settings.min_gossips_for_stable_state =
                value.parse().map_err(|_| bad("expected integer".into()))?;
        }
        _ => return Err(StrandError::UnknownSetting(key.to_owned())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let cmd =
            AdminCommand::parse("set enable-self-initiated-rebuilding true --ttl max").unwrap();
        assert_eq!(cmd.key, "enable-self-initiated-rebuilding");
        assert_eq!(cmd.value, "true");
        assert_eq!(cmd.ttl, Ttl::Max);

        let cmd = AdminCommand::parse("set event-log-grace-period 5s --ttl 30m").unwrap();
        assert_eq!(cmd.ttl, Ttl::For(Duration::from_secs(30 * 60)));

        assert!(AdminCommand::parse("get foo").is_err());
        assert!(AdminCommand::parse("set foo").is_err());
        assert!(AdminCommand::parse("set a b c").is_err());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let overrides = RuntimeOverrides::new();
        let base = RebuildingSettings {
            enable_self_initiated_rebuilding: false,
            ..Default::default()
        };
        assert!(!overrides.apply(&base).enable_self_initiated_rebuilding);

        overrides
            .execute("set enable-self-initiated-rebuilding true --ttl max")
            .unwrap();
        assert!(overrides.apply(&base).enable_self_initiated_rebuilding);

        overrides.unset("enable-self-initiated-rebuilding");
        assert!(!overrides.apply(&base).enable_self_initiated_rebuilding);
    }

    #[test]
    fn test_ttl_expiry() {
        let overrides = RuntimeOverrides::new();
        overrides
            .set("max-node-rebuilding-percentage", "50", Ttl::For(Duration::ZERO))
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(overrides.get("max-node-rebuilding-percentage"), None);
        assert_eq!(
            overrides.apply(&RebuildingSettings::default()).max_node_rebuilding_percentage,
            RebuildingSettings::default().max_node_rebuilding_percentage
        );
    }

    #[test]
    fn test_rejects_unknown_keys_and_bad_values() {
        let overrides = RuntimeOverrides::new();
        assert!(overrides.set("no-such-setting", "1", Ttl::Max).is_err());
        assert!(overrides
            .set("max-node-rebuilding-percentage", "101", Ttl::Max)
            .is_err());
        assert!(overrides
            .set("self-initiated-rebuilding-grace-period", "soon", Ttl::Max)
            .is_err());
    }
}
