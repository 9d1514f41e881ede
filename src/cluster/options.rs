//! Client configuration and its builder.

use std::sync::Arc;
use std::time::Duration;

use crate::core::connection::TcpConnector;
use crate::core::{Connector, Endpoint, Error, Result};

use super::client::ClusterClient;

/// Default period between scheduled topology refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
/// Default number of times a command may be executed before redirects give up.
pub const DEFAULT_MAX_EXECUTIONS: u32 = 5;
/// Default timeout for opening a connection or querying a seed.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default timeout for one command submission.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Validated cluster client configuration.
///
/// Build it with [`ClusterClientBuilder`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "json", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct ClusterOptions {
    /// Bootstrap seeds, tried concurrently.
    pub seeds: Vec<Endpoint>,
    /// Whether the background refresh loop runs.
    pub periodic_refresh: bool,
    /// Period of the background refresh loop.
    pub refresh_interval: Duration,
    /// Whether a `MOVED` reply wakes the refresh loop early.
    pub refresh_on_moved: bool,
    /// Maximum executions per command, redirects included.
    pub max_executions: u32,
    /// Timeout for opening connections and for each seed query.
    pub connect_timeout: Duration,
    /// Timeout for each command submission.
    pub command_timeout: Duration,
}

impl ClusterOptions {
    /// Endpoint for an address learned at runtime (e.g. from a redirect),
    /// carrying the bootstrap credential.
    pub(crate) fn endpoint_for(&self, address: &str) -> Result<Endpoint> {
        let endpoint = Endpoint::parse(address)?;
        Ok(match self.seeds.first() {
            Some(seed) => endpoint.with_credentials(
                seed.username().map(str::to_string),
                seed.password().map(str::to_string),
            ),
            None => endpoint,
        })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(invalid("at least one seed address is required"));
        }
        if self.max_executions == 0 {
            return Err(invalid("max_executions must be at least 1"));
        }
        if self.refresh_interval.is_zero() {
            return Err(invalid("refresh_interval must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidArgument {
        message: message.to_string(),
    }
}

/// Builder for configuring and creating a [`ClusterClient`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use slotwise::ClusterClientBuilder;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ClusterClientBuilder::new()
///     .seeds("127.0.0.1:7000,127.0.0.1:7001")
///     .password("secret")
///     .periodic_refresh(true)
///     .refresh_interval(Duration::from_secs(5))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ClusterClientBuilder {
    seeds: Vec<String>,
    username: Option<String>,
    password: Option<String>,
    periodic_refresh: bool,
    refresh_interval: Option<Duration>,
    refresh_on_moved: Option<bool>,
    max_executions: Option<u32>,
    connect_timeout: Option<Duration>,
    command_timeout: Option<Duration>,
    connector: Option<Arc<dyn Connector>>,
}

impl ClusterClientBuilder {
    /// Creates a new [`ClusterClientBuilder`] instance.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds seed addresses from a comma-separated list.
    ///
    /// Each entry is `host:port` or `redis://[user:password@]host:port`.
    #[inline]
    pub fn seeds(mut self, addresses: &str) -> Self {
        self.seeds.extend(
            addresses
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string),
        );
        self
    }

    /// Adds one seed address.
    #[inline]
    pub fn seed(mut self, address: impl Into<String>) -> Self {
        self.seeds.push(address.into());
        self
    }

    /// Sets the ACL user name forwarded to every connection.
    #[inline]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password forwarded to every connection.
    ///
    /// Overrides a password embedded in the seed addresses.
    #[inline]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Enables or disables the background topology refresh.
    #[inline]
    pub fn periodic_refresh(mut self, enabled: bool) -> Self {
        self.periodic_refresh = enabled;
        self
    }

    /// Sets the refresh period (default: 60 s).
    #[inline]
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Whether a `MOVED` reply triggers an early refresh (default: true).
    #[inline]
    pub fn refresh_on_moved(mut self, enabled: bool) -> Self {
        self.refresh_on_moved = Some(enabled);
        self
    }

    /// Sets how many times a command may execute, redirects included (default: 5).
    #[inline]
    pub fn max_executions(mut self, max: u32) -> Self {
        self.max_executions = Some(max);
        self
    }

    /// Sets the connect and seed query timeout (default: 10 s).
    #[inline]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the per-command timeout (default: 60 s).
    #[inline]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Uses a custom [`Connector`] instead of plain TCP.
    #[inline]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Validates the configuration without connecting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if no seed is set, a seed cannot be
    /// parsed, or a numeric option is out of range.
    pub fn options(&self) -> Result<ClusterOptions> {
        let seeds = self
            .seeds
            .iter()
            .map(|s| {
                let seed = Endpoint::parse(s)?;
                if self.password.is_none() && self.username.is_none() {
                    return Ok(seed);
                }
                let username = self
                    .username
                    .clone()
                    .or_else(|| seed.username().map(str::to_string));
                let password = self
                    .password
                    .clone()
                    .or_else(|| seed.password().map(str::to_string));
                Ok(seed.with_credentials(username, password))
            })
            .collect::<Result<Vec<_>>>()?;

        let options = ClusterOptions {
            seeds,
            periodic_refresh: self.periodic_refresh,
            refresh_interval: self.refresh_interval.unwrap_or(DEFAULT_REFRESH_INTERVAL),
            refresh_on_moved: self.refresh_on_moved.unwrap_or(true),
            max_executions: self.max_executions.unwrap_or(DEFAULT_MAX_EXECUTIONS),
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            command_timeout: self.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT),
        };
        options.validate()?;
        Ok(options)
    }

    /// Builds the client and loads the initial partitions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for bad configuration and
    /// [`Error::BootstrapFailure`] if no seed answers.
    pub async fn build(self) -> Result<ClusterClient> {
        let options = self.options()?;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::default()));
        ClusterClient::with_connector(options, connector).await
    }
}
