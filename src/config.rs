use crate::{
    error::{MifloraError, Result},
    scheduler::validate_sweep_params,
    types::{Peripheral, PublishFormat, SweepParams},
};
use clap::Parser;

/// Default MQTT port
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Command line of the `miflorad` binary
///
/// Every option can also be set through the environment variable shown in `--help`.
#[derive(Debug, Clone, Parser)]
#[command(name = "miflorad", version, about = "Mi Flora plant sensor daemon", long_about = None)]
pub struct Cli {
    /// Peripheral addresses, read in this order every sweep
    #[arg(env = "MIFLORAD_PERIPHERALS", value_delimiter = ',')]
    pub peripherals: Vec<String>,

    /// Upper bound of every radio operation in milliseconds
    #[arg(long, env = "MIFLORAD_SCAN_TIMEOUT_MS", default_value_t = 10_000)]
    pub scan_timeout_ms: u64,

    /// Period between sweeps in milliseconds
    #[arg(long, env = "MIFLORAD_INTERVAL_MS", default_value_t = 25_000)]
    pub interval_ms: u64,

    /// Attempts per peripheral and sweep
    #[arg(long, env = "MIFLORAD_MAX_ATTEMPTS", default_value_t = 2)]
    pub max_attempts: u32,

    /// Metrics namespace for Graphite paths
    #[arg(long, env = "MIFLORAD_PREFIX", default_value = "sensors")]
    pub prefix: String,

    /// Line format of published metrics
    #[arg(long, env = "MIFLORAD_FORMAT", value_enum, default_value_t = PublishFormat::Graphite)]
    pub format: PublishFormat,

    /// MQTT broker host; lines go to stdout if unset
    #[arg(long, env = "MIFLORAD_BROKER_HOST")]
    pub broker_host: Option<String>,

    /// MQTT broker port
    #[arg(long, env = "MIFLORAD_BROKER_PORT", default_value_t = DEFAULT_BROKER_PORT)]
    pub broker_port: u16,

    /// MQTT user name
    #[arg(long, env = "MIFLORAD_BROKER_USERNAME")]
    pub broker_username: Option<String>,

    /// MQTT password
    #[arg(long, env = "MIFLORAD_BROKER_PASSWORD", hide_env_values = true)]
    pub broker_password: Option<String>,

    /// Connect to the broker over TLS
    #[arg(long, env = "MIFLORAD_BROKER_TLS")]
    pub broker_tls: bool,

    /// Prepended to the `miflora` topic
    #[arg(long, env = "MIFLORAD_TOPIC_PREFIX", default_value = "")]
    pub topic_prefix: String,

    /// MQTT client identifier
    #[arg(long, env = "MIFLORAD_CLIENT_ID", default_value = "miflorad")]
    pub client_id: String,

    /// Index of the Bluetooth adapter to use
    #[arg(long, env = "MIFLORAD_ADAPTER", default_value_t = 0)]
    pub adapter: usize,

    /// Run a single sweep and exit
    #[arg(long, env = "MIFLORAD_ONESHOT")]
    pub oneshot: bool,
}

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Credentials, if the broker needs them
    pub credentials: Option<(String, String)>,
    /// Use TLS with the platform's root certificates
    pub tls: bool,
    /// MQTT client identifier
    pub client_id: String,
}

/// Validated daemon configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Peripherals in sweep order
    pub peripherals: Vec<Peripheral>,
    /// Sweep timing
    pub sweep: SweepParams,
    /// Graphite namespace
    pub prefix: String,
    /// Line format
    pub format: PublishFormat,
    /// Broker settings; `None` publishes to stdout
    pub broker: Option<BrokerConfig>,
    /// Prepended to the `miflora` topic
    pub topic_prefix: String,
    /// Bluetooth adapter index
    pub adapter: usize,
    /// Single sweep mode
    pub oneshot: bool,
}

impl Config {
    /// Validate the command line
    ///
    /// # Errors
    ///
    /// Returns [`MifloraError::Validation`] if no peripherals are given, the
    /// sweep timing cannot work, or the broker settings are incomplete.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let peripherals: Vec<Peripheral> = cli
            .peripherals
            .iter()
            .map(|address| address.trim())
            .filter(|address| !address.is_empty())
            .map(Peripheral::new)
            .collect();

        let sweep = SweepParams {
            scan_timeout_ms: cli.scan_timeout_ms,
            interval_ms: cli.interval_ms,
            max_attempts: cli.max_attempts,
        };
        validate_sweep_params(&sweep, peripherals.len())?;

        let broker = match cli.broker_host {
            Some(host) if !host.trim().is_empty() => {
                let credentials = match (cli.broker_username, cli.broker_password) {
                    (Some(username), Some(password)) => Some((username, password)),
                    (Some(username), None) => Some((username, String::new())),
                    (None, Some(_)) => {
                        return Err(MifloraError::Validation(
                            "broker password given without a user name".to_string(),
                        ))
                    }
                    (None, None) => None,
                };

                if cli.client_id.is_empty() {
                    return Err(MifloraError::Validation(
                        "client id must not be empty".to_string(),
                    ));
                }

                Some(BrokerConfig {
                    host,
                    port: cli.broker_port,
                    credentials,
                    tls: cli.broker_tls,
                    client_id: cli.client_id,
                })
            }
            _ => None,
        };

        Ok(Self {
            peripherals,
            sweep,
            prefix: cli.prefix,
            format: cli.format,
            broker,
            topic_prefix: cli.topic_prefix,
            adapter: cli.adapter,
            oneshot: cli.oneshot,
        })
    }
}
