//! Gateway configuration
//!
//! Every option is both a command-line flag and an environment variable, with
//! the environment the usual way to configure a deployed gateway. Durations
//! are plain seconds. Validation runs after parsing: a live run needs Telegram
//! credentials, a dry run does not.

use std::time::Duration;

use clap::Parser;

/// Store-and-forward SMS to Telegram gateway.
#[derive(Debug, Clone, Parser)]
#[command(name = "smsgate", version, about)]
pub struct Config {
    /// Telegram bot token used for message delivery and alerts.
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", default_value = "", hide_env_values = true)]
    pub telegram_token: String,

    /// Comma-separated Telegram chat IDs to deliver every message to.
    #[arg(long, env = "TELEGRAM_CHAT_IDS", value_delimiter = ',')]
    pub chat_ids: Vec<i64>,

    /// Serial device the modem is attached to.
    #[arg(long, env = "SERIAL_PORT", default_value = "/dev/ttyUSB0")]
    pub serial_port: String,

    #[arg(long, env = "BAUD_RATE", default_value_t = 115200)]
    pub baud_rate: u32,

    /// Log filter in tracing env-filter syntax (e.g. "info", "smsgate=debug").
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log and poll but never send to Telegram or delete from the SIM.
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,

    /// Age in seconds after which parts of an incomplete multipart message
    /// are reclaimed from the SIM; 0 disables the sweep.
    #[arg(long, env = "MULTIPART_MAX_AGE_SECS", default_value_t = 0)]
    pub multipart_max_age_secs: u64,

    /// Timeout in seconds for a single Telegram API call.
    #[arg(long, env = "TELEGRAM_SEND_TIMEOUT_SECS", default_value_t = 20)]
    pub telegram_send_timeout_secs: u64,

    /// Grace period in seconds to wait for network registration before a
    /// session fails; 0 fails on the first unregistered poll.
    #[arg(long, env = "NETWORK_REG_GRACE_SECS", default_value_t = 90)]
    pub network_reg_grace_secs: u64,

    /// Seconds between SMS polls.
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Seconds between modem health checks.
    #[arg(long, env = "HEALTH_CHECK_INTERVAL_SECS", default_value_t = 60)]
    pub health_check_interval_secs: u64,
}

impl Config {
    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.dry_run {
            if self.telegram_token.is_empty() {
                anyhow::bail!("TELEGRAM_BOT_TOKEN is required (or set DRY_RUN=true)");
            }
            if self.chat_ids.is_empty() {
                anyhow::bail!("at least one chat ID is required (TELEGRAM_CHAT_IDS)");
            }
        }
        if self.telegram_send_timeout_secs == 0 {
            anyhow::bail!("TELEGRAM_SEND_TIMEOUT_SECS must be greater than zero");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("POLL_INTERVAL_SECS must be greater than zero");
        }
        if self.health_check_interval_secs == 0 {
            anyhow::bail!("HEALTH_CHECK_INTERVAL_SECS must be greater than zero");
        }
        if self.baud_rate == 0 {
            anyhow::bail!("BAUD_RATE must be greater than zero");
        }
        Ok(())
    }

    pub fn telegram_send_timeout(&self) -> Duration {
        Duration::from_secs(self.telegram_send_timeout_secs)
    }

    pub fn network_reg_grace(&self) -> Duration {
        Duration::from_secs(self.network_reg_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// `None` when the stale-part sweep is disabled.
    pub fn multipart_max_age(&self) -> Option<Duration> {
        if self.multipart_max_age_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.multipart_max_age_secs))
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            telegram_token: "123:token".to_string(),
            chat_ids: vec![42],
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            log_level: "info".to_string(),
            dry_run: false,
            multipart_max_age_secs: 0,
            telegram_send_timeout_secs: 20,
            network_reg_grace_secs: 90,
            poll_interval_secs: 10,
            health_check_interval_secs: 60,
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn test_token_required_unless_dry_run() {
        let mut config = base();
        config.telegram_token.clear();
        assert!(config.validate().is_err());

        config.dry_run = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chat_ids_required_unless_dry_run() {
        let mut config = base();
        config.chat_ids.clear();
        assert!(config.validate().is_err());

        config.dry_run = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = base();
        config.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = base();
        config.telegram_send_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multipart_max_age_zero_is_disabled() {
        let mut config = base();
        assert_eq!(config.multipart_max_age(), None);
        config.multipart_max_age_secs = 3600;
        assert_eq!(config.multipart_max_age(), Some(Duration::from_secs(3600)));
    }
}
