//! The daemon's configuration surface.
//!
//! Options arrive on the command line; [`EffectiveConfig`] is the validated
//! and clamped form handed down to the coordinator and the slots.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use hidpp::{backoff::BackoffProfiles, nibble::U4};
use thiserror::Error;

/// Command-line options.
#[derive(Debug, Clone, Parser)]
#[command(name = "batteryd", version, about, long_about = None)]
pub struct Cli {
    /// The hidraw node of the receiver or directly connected device.
    #[arg(long, value_name = "PATH")]
    pub device: PathBuf,

    /// Software ID stamped into every request (1..=15). 0 is reserved for
    /// device-initiated events and rejected.
    #[arg(long, value_name = "ID", default_value_t = 0x0a)]
    pub software_id: u8,

    /// Skip devices whose name contains this pattern. Repeatable.
    #[arg(long = "disable", value_name = "PATTERN")]
    pub disabled_devices: Vec<String>,

    /// Seconds between battery polls (clamped to 20..=3600).
    #[arg(long, value_name = "SECS", default_value_t = 180)]
    pub poll_period: u64,

    /// Additional delay after a failed poll cycle, in seconds.
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub retry_time: u64,

    /// Keep the polling loop running once battery events arrive.
    #[arg(long, value_name = "BOOL", default_value_t = true, action = clap::ArgAction::Set)]
    pub keep_polling_with_events: bool,

    /// Seconds after a device comes online during which battery events are
    /// accepted but not published.
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    pub battery_event_delay: u64,

    /// Publish a `-1` battery update when a device goes offline.
    #[arg(long, value_name = "BOOL", default_value_t = true, action = clap::ArgAction::Set)]
    pub notify_offline: bool,

    /// Override a backoff profile field, e.g. `init.max_attempts=5` or
    /// `battery.initial_timeout=2000` (durations in milliseconds).
    /// Repeatable.
    #[arg(long = "backoff", value_name = "PROFILE.FIELD=VALUE")]
    pub backoff_overrides: Vec<String>,

    /// Log at debug level. `RUST_LOG` overrides this.
    #[arg(short, long)]
    pub verbose: bool,

    /// Hint for the external rolling log writer. Accepted and passed on.
    #[arg(long, value_name = "N")]
    pub log_max_lines: Option<u32>,
}

/// The lower poll-period clamp. Debug builds allow faster polling for
/// development against real hardware.
#[cfg(not(debug_assertions))]
const MIN_POLL_PERIOD: u64 = 20;
#[cfg(debug_assertions)]
const MIN_POLL_PERIOD: u64 = 10;

const MAX_POLL_PERIOD: u64 = 3600;

/// The validated configuration handed to the coordinator.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub software_id: U4,
    /// Lowercased disallow patterns, matched as substrings of the
    /// lowercased device name.
    pub disabled_devices: Vec<String>,
    pub poll_period: Duration,
    pub retry_time: Duration,
    pub keep_polling_with_events: bool,
    pub battery_event_delay: Duration,
    pub notify_offline: bool,
    pub profiles: BackoffProfiles,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("software ID must be in 1..=15, got {0}")]
    SoftwareId(u8),

    #[error("unrecognized backoff override {0:?}, expected PROFILE.FIELD=VALUE")]
    BackoffOverride(String),
}

impl EffectiveConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        if cli.software_id == 0 || cli.software_id > U4::MAX {
            return Err(ConfigError::SoftwareId(cli.software_id));
        }

        let mut profiles = BackoffProfiles::default();
        for override_spec in &cli.backoff_overrides {
            apply_backoff_override(&mut profiles, override_spec)?;
        }

        Ok(Self {
            software_id: U4::from_lo(cli.software_id),
            disabled_devices: cli
                .disabled_devices
                .iter()
                .map(|pattern| pattern.to_lowercase())
                .collect(),
            poll_period: Duration::from_secs(
                cli.poll_period.clamp(MIN_POLL_PERIOD, MAX_POLL_PERIOD),
            ),
            retry_time: Duration::from_secs(cli.retry_time),
            keep_polling_with_events: cli.keep_polling_with_events,
            battery_event_delay: Duration::from_secs(cli.battery_event_delay),
            notify_offline: cli.notify_offline,
            profiles,
        })
    }

    /// Checks a device name against the disallow list.
    pub fn is_disabled_device(&self, device_name: &str) -> bool {
        let lowered = device_name.to_lowercase();
        self.disabled_devices
            .iter()
            .any(|pattern| lowered.contains(pattern))
    }
}

fn apply_backoff_override(
    profiles: &mut BackoffProfiles,
    spec: &str,
) -> Result<(), ConfigError> {
    let invalid = || ConfigError::BackoffOverride(spec.to_string());

    let (target, value) = spec.split_once('=').ok_or_else(invalid)?;
    let (profile_name, field) = target.split_once('.').ok_or_else(invalid)?;
    let value: u64 = value.trim().parse().map_err(|_| invalid())?;

    let profile = profiles.get_mut(profile_name.trim()).ok_or_else(invalid)?;
    let mut updated = profile.clone();
    match field.trim() {
        "initial_delay" => updated.initial_delay = Duration::from_millis(value),
        "max_delay" => updated.max_delay = Duration::from_millis(value),
        "initial_timeout" => updated.initial_timeout = Duration::from_millis(value),
        "max_timeout" => updated.max_timeout = Duration::from_millis(value),
        "multiplier" => updated.multiplier = value as u32,
        "max_attempts" => updated.max_attempts = value as u32,
        _ => return Err(invalid()),
    }

    // Route through the constructor so its invariant corrections re-apply.
    *profile = hidpp::backoff::BackoffProfile::new(
        profile.name,
        updated.initial_delay,
        updated.max_delay,
        updated.initial_timeout,
        updated.max_timeout,
        updated.multiplier,
        updated.max_attempts,
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["batteryd", "--device", "/dev/hidraw0"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn software_id_bounds() {
        assert!(EffectiveConfig::from_cli(&cli(&["--software-id", "0"])).is_err());
        assert!(EffectiveConfig::from_cli(&cli(&["--software-id", "16"])).is_err());

        let config = EffectiveConfig::from_cli(&cli(&["--software-id", "15"])).unwrap();
        assert_eq!(config.software_id.to_lo(), 15);
    }

    #[test]
    fn poll_period_is_clamped() {
        let config = EffectiveConfig::from_cli(&cli(&["--poll-period", "5"])).unwrap();
        assert_eq!(config.poll_period, Duration::from_secs(MIN_POLL_PERIOD));

        let config = EffectiveConfig::from_cli(&cli(&["--poll-period", "90000"])).unwrap();
        assert_eq!(config.poll_period, Duration::from_secs(3600));
    }

    #[test]
    fn disallow_list_matches_substrings_case_insensitively() {
        let config = EffectiveConfig::from_cli(&cli(&["--disable", "G500"])).unwrap();

        assert!(config.is_disabled_device("Gaming Mouse G500s"));
        assert!(config.is_disabled_device("gaming mouse g500"));
        assert!(!config.is_disabled_device("MX Master 3"));
    }

    #[test]
    fn backoff_overrides() {
        let config = EffectiveConfig::from_cli(&cli(&[
            "--backoff",
            "battery.max_attempts=5",
            "--backoff",
            "ping.initial_timeout=250",
        ]))
        .unwrap();

        assert_eq!(config.profiles.battery.max_attempts, 5);
        assert_eq!(
            config.profiles.ping.initial_timeout,
            Duration::from_millis(250)
        );

        assert!(EffectiveConfig::from_cli(&cli(&["--backoff", "nope"])).is_err());
        assert!(EffectiveConfig::from_cli(&cli(&["--backoff", "ping.bogus=1"])).is_err());
    }
}
