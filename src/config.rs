//! Runtime configuration for listeners, dialers, and connections.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::core::{
    Error, Result, DEFAULT_ACCEPT_POLL, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DATA_POLL,
    DEFAULT_FAST_POLL, DEFAULT_HANDSHAKE_ENDPOINT, DEFAULT_IDLE_TIMEOUT, DEFAULT_PING_INTERVAL,
    DEFAULT_REQ_PREFIX, DEFAULT_RES_PREFIX, DEFAULT_SAS_EXPIRY, DEFAULT_TOKEN_ENDPOINT,
};
use crate::metrics::{DefaultMetrics, Metrics};

/// Runtime settings for a connection or listener.
///
/// Immutable after construction; build one through [`ConfigBuilder`].
#[derive(Clone)]
pub struct Config {
    /// Name of the shared handshake inbox resource.
    pub handshake_endpoint: String,
    /// Name of the shared token outbox resource. Must differ from the
    /// handshake endpoint.
    pub token_endpoint: String,
    /// Prefix of the initiator-to-listener session resources.
    pub req_prefix: String,
    /// Prefix of the listener-to-initiator session resources. Must differ
    /// from the request prefix.
    pub res_prefix: String,

    /// Validity window of issued signed URLs.
    pub sas_expiry: Duration,

    /// Starting interval of the adaptive poller.
    pub fast_poll: Duration,
    /// Steady-state (maximum) polling interval.
    pub data_poll: Duration,
    /// Listener's handshake inbox scan interval.
    pub accept_poll: Duration,
    /// Keep-alive cadence; zero disables keep-alive.
    pub ping_interval: Duration,
    /// Maximum dial duration.
    pub connect_timeout: Duration,
    /// Janitor eviction threshold for silent peers.
    pub idle_timeout: Duration,

    pub(crate) cancel: CancellationToken,
    pub(crate) metrics: Arc<dyn Metrics>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("handshake_endpoint", &self.handshake_endpoint)
            .field("token_endpoint", &self.token_endpoint)
            .field("req_prefix", &self.req_prefix)
            .field("res_prefix", &self.res_prefix)
            .field("sas_expiry", &self.sas_expiry)
            .field("fast_poll", &self.fast_poll)
            .field("data_poll", &self.data_poll)
            .field("accept_poll", &self.accept_poll)
            .field("ping_interval", &self.ping_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_endpoint: DEFAULT_HANDSHAKE_ENDPOINT.to_string(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            req_prefix: DEFAULT_REQ_PREFIX.to_string(),
            res_prefix: DEFAULT_RES_PREFIX.to_string(),
            sas_expiry: DEFAULT_SAS_EXPIRY,
            fast_poll: DEFAULT_FAST_POLL,
            data_poll: DEFAULT_DATA_POLL,
            accept_poll: DEFAULT_ACCEPT_POLL,
            ping_interval: DEFAULT_PING_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            cancel: CancellationToken::new(),
            metrics: Arc::new(DefaultMetrics::new()),
        }
    }
}

impl Config {
    /// Check that the configuration is sane.
    pub fn validate(&self) -> Result<()> {
        if self.handshake_endpoint == self.token_endpoint {
            return Err(Error::InvalidConfig(
                "handshake and token endpoints must differ".into(),
            ));
        }
        if self.req_prefix == self.res_prefix {
            return Err(Error::InvalidConfig(
                "request and response prefixes must differ".into(),
            ));
        }
        Ok(())
    }

    /// Start and end times for a signed URL minted under this configuration.
    ///
    /// The window opens five minutes in the past to absorb clock skew between
    /// the issuer and the storage service.
    pub fn sas_times(&self) -> (SystemTime, SystemTime) {
        let now = SystemTime::now();
        (now - Duration::from_secs(300), now + self.sas_expiry)
    }

    /// The cancellation scope all network operations derive from.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The metrics sink counters are reported to.
    pub fn metrics(&self) -> Arc<dyn Metrics> {
        Arc::clone(&self.metrics)
    }
}

/// Builder for [`Config`].
///
/// Setters ignore zero or empty values so callers can pass through optional
/// user input unchanged; `ping_interval` is the exception, where zero
/// explicitly disables keep-alive.
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Start from library defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the shared rendezvous resource names.
    pub fn endpoints(mut self, handshake: &str, token: &str) -> Self {
        if !handshake.is_empty() {
            self.config.handshake_endpoint = handshake.to_string();
        }
        if !token.is_empty() {
            self.config.token_endpoint = token.to_string();
        }
        self
    }

    /// Override the per-session resource name prefixes.
    pub fn prefixes(mut self, req: &str, res: &str) -> Self {
        if !req.is_empty() {
            self.config.req_prefix = req.to_string();
        }
        if !res.is_empty() {
            self.config.res_prefix = res.to_string();
        }
        self
    }

    /// Set the signed URL validity window. Grants cannot be revoked once
    /// minted, so keep this short.
    pub fn sas_expiry(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.config.sas_expiry = d;
        }
        self
    }

    /// Set how frequently the listener scans for new connections.
    pub fn accept_poll(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.config.accept_poll = d;
        }
        self
    }

    /// Set the polling interval used while data is actively flowing.
    pub fn fast_poll(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.config.fast_poll = d;
        }
        self
    }

    /// Set the steady-state polling interval for idle connections.
    pub fn data_poll(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.config.data_poll = d;
        }
        self
    }

    /// Set the keep-alive cadence. Zero disables keep-alive.
    pub fn ping_interval(mut self, d: Duration) -> Self {
        self.config.ping_interval = d;
        self
    }

    /// Set the maximum time a dial waits for the listener's answer.
    pub fn connect_timeout(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.config.connect_timeout = d;
        }
        self
    }

    /// Set the grace period after which the janitor purges connections whose
    /// peer has gone silent.
    pub fn idle_timeout(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.config.idle_timeout = d;
        }
        self
    }

    /// Attach a parent cancellation scope for all network operations.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.config.cancel = token.child_token();
        self
    }

    /// Use a custom metrics sink instead of the atomic default.
    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.config.metrics = metrics;
        self
    }

    /// Finish the build.
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.handshake_endpoint, "handshake");
        assert_eq!(cfg.token_endpoint, "token");
        assert_eq!(cfg.fast_poll, Duration::from_millis(10));
        assert_eq!(cfg.data_poll, Duration::from_millis(500));
    }

    #[test]
    fn test_equal_endpoints_rejected() {
        let cfg = ConfigBuilder::new().endpoints("shared", "shared").build();
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_equal_prefixes_rejected() {
        let cfg = ConfigBuilder::new().prefixes("ch", "ch").build();
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_overrides_keep_defaults() {
        let cfg = ConfigBuilder::new()
            .endpoints("", "")
            .prefixes("", "")
            .build();
        assert_eq!(cfg.handshake_endpoint, "handshake");
        assert_eq!(cfg.req_prefix, "req");
    }

    #[test]
    fn test_zero_ping_disables_keepalive() {
        let cfg = ConfigBuilder::new().ping_interval(Duration::ZERO).build();
        assert!(cfg.ping_interval.is_zero());
    }

    #[test]
    fn test_sas_window_straddles_now() {
        let cfg = Config::default();
        let (start, end) = cfg.sas_times();
        let now = SystemTime::now();
        assert!(start < now);
        assert!(end > now);
    }
}
