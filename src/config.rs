// ABOUTME: Tunable timer and window-size configuration for a connection
// ABOUTME: Mirrors the keep-alive config's builder-method style with protocol-sane defaults

use std::time::Duration;

use crate::error::ConfigError;

/// Timer and flow-control knobs for a `Connection`.
///
/// Defaults match the values most IEC 60870-5-104 deployments use:
/// `response_timeout` (t1) 15s, `supervisory_timeout` (t2) 10s, `test_timeout`
/// (t3) 20s, a send window (k) of 12, and a receive window (w_max) of 8.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub response_timeout: Duration,
    pub supervisory_timeout: Duration,
    pub test_timeout: Duration,
    pub send_window_size: u16,
    pub receive_window_size: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(15),
            supervisory_timeout: Duration::from_secs(10),
            test_timeout: Duration::from_secs(20),
            send_window_size: 12,
            receive_window_size: 8,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_supervisory_timeout(mut self, timeout: Duration) -> Self {
        self.supervisory_timeout = timeout;
        self
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    pub fn with_send_window_size(mut self, size: u16) -> Self {
        self.send_window_size = size;
        self
    }

    pub fn with_receive_window_size(mut self, size: u16) -> Self {
        self.receive_window_size = size;
        self
    }

    /// Checks the invariants the protocol requires of this configuration.
    /// Called automatically by `connect()` and `Listener::bind()`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisory_timeout >= self.response_timeout {
            return Err(ConfigError::SupervisoryNotLessThanResponse);
        }
        if self.send_window_size == 0 || self.send_window_size as u32 >= 0x8000 {
            return Err(ConfigError::InvalidSendWindow(self.send_window_size));
        }
        if self.receive_window_size == 0 {
            return Err(ConfigError::InvalidReceiveWindow(self.receive_window_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(ConnectionConfig::default().validate().is_ok());
    }

    #[test]
    fn supervisory_must_be_less_than_response() {
        let config = ConnectionConfig::new()
            .with_response_timeout(Duration::from_secs(5))
            .with_supervisory_timeout(Duration::from_secs(5));
        assert_eq!(
            config.validate(),
            Err(ConfigError::SupervisoryNotLessThanResponse)
        );
    }

    #[test]
    fn zero_send_window_is_rejected() {
        let config = ConnectionConfig::new().with_send_window_size(0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidSendWindow(0)));
    }
}
