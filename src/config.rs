use std::fmt::Display;
use std::time::Duration;

use clap::Parser;
use fieldx::fxstruct;
use garde::Validate;

use crate::error::Error;
use crate::error::Result;
use crate::listener::ReconnectPolicy;

const DEFAULT_PAGE_SIZE: u32 = 10;
const DEFAULT_GATEWAY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_INITIAL_DELAY_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Tunables of a [`Ledger`](crate::ledger::Ledger) session. Every option can also come from a `CARLOG_*` environment
/// variable.
#[derive(Debug, Clone, clap::Parser, Validate)]
#[fxstruct(no_new, default(off), get(copy))]
#[clap(about, version, name = "carlog")]
pub struct LedgerConfig {
    /// Records per page.
    #[clap(long, env = "CARLOG_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    #[garde(range(min = 1, max = 1000))]
    page_size: u32,

    /// How long to wait for any single gateway call, in milliseconds.
    #[clap(long, env = "CARLOG_GATEWAY_TIMEOUT_MS", default_value_t = DEFAULT_GATEWAY_TIMEOUT_MS)]
    #[garde(range(min = 1))]
    gateway_timeout_ms: u64,

    /// Maximum number of cached pages, 0 for no limit.
    #[clap(long, env = "CARLOG_CACHE_CAPACITY", default_value_t = 0)]
    #[garde(skip)]
    cache_capacity: u64,

    /// How many times to try re-subscribing after the change feed drops. 0 disables reconnecting.
    #[clap(long, env = "CARLOG_RECONNECT_ATTEMPTS", default_value_t = DEFAULT_RECONNECT_ATTEMPTS)]
    #[garde(skip)]
    reconnect_attempts: u32,

    /// Delay before the first reconnect attempt, in milliseconds. Doubles with every failed attempt.
    #[clap(long, env = "CARLOG_RECONNECT_INITIAL_DELAY_MS", default_value_t = DEFAULT_RECONNECT_INITIAL_DELAY_MS)]
    #[garde(range(min = 1), custom(Self::not_more_than("reconnect-max-delay-ms", &self.reconnect_max_delay_ms)))]
    reconnect_initial_delay_ms: u64,

    /// Upper limit of the reconnect delay, in milliseconds.
    #[clap(long, env = "CARLOG_RECONNECT_MAX_DELAY_MS", default_value_t = DEFAULT_RECONNECT_MAX_DELAY_MS)]
    #[garde(skip)]
    reconnect_max_delay_ms: u64,
}

impl LedgerConfig {
    /// Parse command line style arguments, the first one being the program name, and validate the result. Missing
    /// options fall back to their environment variables, then to the defaults.
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(args)?.validated()
    }

    pub fn validated(self) -> Result<Self> {
        self.validate().map_err(|report| Error::Config(report.to_string()))?;
        Ok(self)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            attempts:      self.reconnect_attempts,
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay:     Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    fn not_more_than<'a, T: PartialOrd + Display>(
        max_name: &'static str,
        max: &'a T,
    ) -> impl FnOnce(&'a T, &()) -> garde::Result {
        move |value, _| {
            if value > max {
                Err(garde::Error::new(format!(
                    "{} is more than {max_name} ({})",
                    *value, *max
                )))
            }
            else {
                Ok(())
            }
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            page_size:                  DEFAULT_PAGE_SIZE,
            gateway_timeout_ms:         DEFAULT_GATEWAY_TIMEOUT_MS,
            cache_capacity:             0,
            reconnect_attempts:         DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_initial_delay_ms: DEFAULT_RECONNECT_INITIAL_DELAY_MS,
            reconnect_max_delay_ms:     DEFAULT_RECONNECT_MAX_DELAY_MS,
        }
    }
}

/// Install a `tracing` subscriber filtered by `RUST_LOG`.
#[cfg(feature = "tracing")]
pub fn init_tracing() -> Result<()> {
    use tracing::info;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::from_default_env();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| Error::Config(err.to_string()))?;

    info!("Tracing initialized");

    Ok(())
}
