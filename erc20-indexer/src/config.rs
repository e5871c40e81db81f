//! Runtime configuration loaded from `indexer.toml`.
//!
//! Values come from three layers, later ones winning: the TOML file,
//! environment variables and command-line flags (both handled by the CLI,
//! which builds a second [`Config`] and [`Config::merge`]s it on top).
//! The merged result is checked once by [`Config::validate`]; a malformed
//! address, topic or endpoint stops the binary before any RPC is made.
//!
//! When no config file is present every setting must come from the
//! environment or flags.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::transports::http::reqwest::Url;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::fetcher::{FetchSettings, RetryPolicy};
use erc20_ledger::TRANSFER_TOPIC;

const DEFAULT_FINALITY: u64 = 12;
const DEFAULT_MAX_BATCH: u64 = 2_000;
const DEFAULT_POLL_MS: u64 = 2_000;
const DEFAULT_MAX_POLL_MS: u64 = 30_000;
const DEFAULT_RPC_RETRIES: u32 = 5;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_RETRY_MAX_MS: u64 = 30_000;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STORAGE_RETRIES: u32 = 3;
const DEFAULT_SUBSCRIBER_BUFFER: usize = 1_024;
const DEFAULT_STATE_PATH: &str = "data/ledger.db";

/// Unvalidated settings as written in the file or passed on the CLI.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Ordered RPC endpoints (best first); later ones are fallbacks.
    pub rpc_urls: Vec<String>,
    /// Token contract address.
    pub contract: Option<String>,
    /// Event signature hash. Defaults to the ERC-20 `Transfer` topic.
    pub topic0: Option<String>,
    /// Block the contract was deployed at; the first block indexed.
    pub deployment_block: Option<u64>,
    /// Blocks kept between the indexed tip and the chain head.
    pub finality_confirmations: Option<u64>,
    /// Upper bound on blocks per `eth_getLogs` request.
    pub max_batch_size: Option<u64>,
    /// First sleep once caught up, in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Ceiling of the idle sleep, which doubles while nothing new is
    /// finalized, in milliseconds.
    pub max_poll_interval_ms: Option<u64>,
    /// Attempts per RPC call before the endpoint is abandoned.
    pub max_rpc_retries: Option<u32>,
    /// First retry delay, in milliseconds.
    pub retry_base_delay_ms: Option<u64>,
    /// Retry delay ceiling, in milliseconds.
    pub retry_max_delay_ms: Option<u64>,
    /// Per-request RPC timeout, in seconds.
    pub request_timeout_secs: Option<u64>,
    /// Consecutive failed commits tolerated before halting.
    pub max_storage_retries: Option<u32>,
    /// Undelivered commits buffered per subscriber before it is dropped.
    pub subscriber_buffer: Option<usize>,
    /// Location of the ledger database.
    pub state_path: Option<PathBuf>,
}

/// Validated, typed configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// RPC endpoints in fallback order. Never empty.
    pub rpc_urls: Vec<Url>,
    /// Token contract address.
    pub contract: Address,
    /// Event signature hash.
    pub topic0: B256,
    /// First block indexed.
    pub deployment_block: u64,
    /// Fetcher tuning.
    pub fetch: FetchSettings,
    /// First sleep once caught up.
    pub poll_interval: Duration,
    /// Idle sleep ceiling.
    pub max_poll_interval: Duration,
    /// Consecutive failed commits tolerated before halting.
    pub max_storage_retries: u32,
    /// Undelivered commits buffered per subscriber.
    pub subscriber_buffer: usize,
    /// Location of the ledger database.
    pub state_path: PathBuf,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Returns [`Config::default`] if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let file_err = |message: String| ConfigError::File {
            path: path.display().to_string(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        toml::from_str(&text).map_err(|e| file_err(e.to_string()))
    }

    /// Overlay `other` on top of `self`. Set values in `other` win; a
    /// non-empty RPC list in `other` replaces the whole list.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            rpc_urls: if other.rpc_urls.is_empty() {
                self.rpc_urls
            } else {
                other.rpc_urls
            },
            contract: other.contract.or(self.contract),
            topic0: other.topic0.or(self.topic0),
            deployment_block: other.deployment_block.or(self.deployment_block),
            finality_confirmations: other
                .finality_confirmations
                .or(self.finality_confirmations),
            max_batch_size: other.max_batch_size.or(self.max_batch_size),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            max_poll_interval_ms: other.max_poll_interval_ms.or(self.max_poll_interval_ms),
            max_rpc_retries: other.max_rpc_retries.or(self.max_rpc_retries),
            retry_base_delay_ms: other.retry_base_delay_ms.or(self.retry_base_delay_ms),
            retry_max_delay_ms: other.retry_max_delay_ms.or(self.retry_max_delay_ms),
            request_timeout_secs: other.request_timeout_secs.or(self.request_timeout_secs),
            max_storage_retries: other.max_storage_retries.or(self.max_storage_retries),
            subscriber_buffer: other.subscriber_buffer.or(self.subscriber_buffer),
            state_path: other.state_path.or(self.state_path),
        }
    }

    /// Where the ledger state lives, without validating anything else.
    /// Read-only commands only need this.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH))
    }

    /// Check every setting and produce typed [`Settings`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first missing or malformed key.
    pub fn validate(self) -> Result<Settings, ConfigError> {
        if self.rpc_urls.is_empty() {
            return Err(ConfigError::Missing("rpc_urls"));
        }
        let rpc_urls = self
            .rpc_urls
            .iter()
            .map(|raw| parse_url(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let contract = parse_address(
            self.contract
                .as_deref()
                .ok_or(ConfigError::Missing("contract"))?,
        )?;
        let topic0 = self
            .topic0
            .as_deref()
            .map_or(Ok(TRANSFER_TOPIC), parse_topic)?;
        let deployment_block = self
            .deployment_block
            .ok_or(ConfigError::Missing("deployment_block"))?;

        let finality_confirmations = positive(
            "finality_confirmations",
            self.finality_confirmations.unwrap_or(DEFAULT_FINALITY),
        )?;
        let max_batch_size = positive(
            "max_batch_size",
            self.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH),
        )?;
        let max_attempts = positive(
            "max_rpc_retries",
            u64::from(self.max_rpc_retries.unwrap_or(DEFAULT_RPC_RETRIES)),
        )?;
        let subscriber_buffer = positive(
            "subscriber_buffer",
            self.subscriber_buffer.unwrap_or(DEFAULT_SUBSCRIBER_BUFFER) as u64,
        )?;

        let base_delay =
            Duration::from_millis(self.retry_base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_MS));
        let max_delay =
            Duration::from_millis(self.retry_max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_MS));
        if max_delay < base_delay {
            return Err(ConfigError::Invalid {
                key: "retry_max_delay_ms",
                value: max_delay.as_millis().to_string(),
                reason: "must not be below retry_base_delay_ms".to_owned(),
            });
        }

        let poll_interval = Duration::from_millis(self.poll_interval_ms.unwrap_or(DEFAULT_POLL_MS));
        let max_poll_interval =
            Duration::from_millis(self.max_poll_interval_ms.unwrap_or(DEFAULT_MAX_POLL_MS))
                .max(poll_interval);

        Ok(Settings {
            rpc_urls,
            contract,
            topic0,
            deployment_block,
            fetch: FetchSettings {
                contract,
                topic0,
                finality_confirmations,
                max_batch_size,
                request_timeout: Duration::from_secs(positive(
                    "request_timeout_secs",
                    self.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
                )?),
                retry: RetryPolicy {
                    max_attempts: u32::try_from(max_attempts).unwrap_or(u32::MAX),
                    base_delay,
                    max_delay,
                },
            },
            poll_interval,
            max_poll_interval,
            max_storage_retries: self
                .max_storage_retries
                .unwrap_or(DEFAULT_STORAGE_RETRIES),
            subscriber_buffer: usize::try_from(subscriber_buffer).unwrap_or(usize::MAX),
            state_path: self.state_path(),
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_owned(),
        reason: reason.to_string(),
    }
}

fn positive(key: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(invalid(key, "0", "must be at least 1"));
    }
    Ok(value)
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| invalid("rpc_urls", raw, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("rpc_urls", raw, "scheme must be http or https"));
    }
    Ok(url)
}

/// Accepts lower-case, upper-case or EIP-55 checksummed hex.
fn parse_address(raw: &str) -> Result<Address, ConfigError> {
    let hex = raw.strip_prefix("0x").unwrap_or(raw);
    if hex.len() != 40 {
        return Err(invalid("contract", raw, "expected 20 bytes of hex"));
    }
    let mixed_case =
        hex.chars().any(|c| c.is_ascii_lowercase()) && hex.chars().any(|c| c.is_ascii_uppercase());
    let address = if mixed_case {
        Address::parse_checksummed(raw, None).map_err(|e| invalid("contract", raw, e))?
    } else {
        Address::from_str(raw).map_err(|e| invalid("contract", raw, e))?
    };
    if address == Address::ZERO {
        return Err(invalid("contract", raw, "zero address is not a contract"));
    }
    Ok(address)
}

fn parse_topic(raw: &str) -> Result<B256, ConfigError> {
    let hex = raw.strip_prefix("0x").unwrap_or(raw);
    if hex.len() != 64 {
        return Err(invalid("topic0", raw, "expected 32 bytes of hex"));
    }
    B256::from_str(raw).map_err(|e| invalid("topic0", raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "0x455e53cbb86018ac2b8092fdcd39d8444affc3f6";

    fn minimal() -> Config {
        Config {
            rpc_urls: vec!["http://127.0.0.1:8545".to_owned()],
            contract: Some(TOKEN.to_owned()),
            deployment_block: Some(100),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_fill_unset_values() {
        let settings = minimal().validate().unwrap();
        assert_eq!(settings.topic0, TRANSFER_TOPIC, "Transfer topic by default");
        assert_eq!(
            settings.fetch.finality_confirmations, DEFAULT_FINALITY,
            "default finality"
        );
        assert_eq!(settings.fetch.max_batch_size, DEFAULT_MAX_BATCH, "default batch");
        assert_eq!(
            settings.state_path,
            PathBuf::from(DEFAULT_STATE_PATH),
            "default state path"
        );
        assert_eq!(
            settings.max_poll_interval,
            Duration::from_millis(DEFAULT_MAX_POLL_MS),
            "default idle ceiling"
        );
    }

    #[test]
    fn parses_toml_file() {
        let text = r#"
            rpc_urls = ["https://rpc.one.example", "https://rpc.two.example"]
            contract = "0x455e53CBB86018Ac2B8092FdCd39d8444aFFC3F6"
            deployment_block = 7
            finality_confirmations = 1
        "#;
        let config: Config = toml::from_str(text).unwrap();
        let settings = config.validate().unwrap();
        assert_eq!(settings.rpc_urls.len(), 2, "both endpoints kept in order");
        assert_eq!(settings.fetch.finality_confirmations, 1, "depth-1 allowed");
    }

    #[test]
    fn later_layers_win() {
        let file = minimal();
        let cli = Config {
            deployment_block: Some(5),
            rpc_urls: vec!["https://override.example".to_owned()],
            ..Config::default()
        };
        let merged = file.merge(cli);
        assert_eq!(merged.deployment_block, Some(5), "flag overrides file");
        assert_eq!(merged.contract.as_deref(), Some(TOKEN), "file value kept");
        assert_eq!(merged.rpc_urls, vec!["https://override.example"], "list replaced");
    }

    #[test]
    fn rejects_malformed_contract() {
        for bad in ["0x1234", "0xzz5e53cbb86018ac2b8092fdcd39d8444affc3f6", ""] {
            let config = Config {
                contract: Some(bad.to_owned()),
                ..minimal()
            };
            assert!(
                matches!(
                    config.validate(),
                    Err(ConfigError::Invalid { key: "contract", .. })
                ),
                "{bad:?} must be rejected"
            );
        }
    }

    #[test]
    fn rejects_bad_checksum() {
        let config = Config {
            contract: Some("0x455E53cbb86018ac2b8092fdcd39d8444affc3f6".to_owned()),
            ..minimal()
        };
        assert!(config.validate().is_err(), "mixed case must be a valid checksum");
    }

    #[test]
    fn rejects_short_topic_and_bad_url() {
        let config = Config {
            topic0: Some("0xddf252ad".to_owned()),
            ..minimal()
        };
        assert!(
            matches!(config.validate(), Err(ConfigError::Invalid { key: "topic0", .. })),
            "topic must be 32 bytes"
        );

        let config = Config {
            rpc_urls: vec!["not a url".to_owned()],
            ..minimal()
        };
        assert!(
            matches!(config.validate(), Err(ConfigError::Invalid { key: "rpc_urls", .. })),
            "endpoint must parse"
        );
    }

    #[test]
    fn requires_endpoint_contract_and_start() {
        assert!(
            matches!(
                Config::default().validate(),
                Err(ConfigError::Missing("rpc_urls"))
            ),
            "rpc list required"
        );
        let config = Config {
            deployment_block: None,
            ..minimal()
        };
        assert!(
            matches!(config.validate(), Err(ConfigError::Missing("deployment_block"))),
            "start block required"
        );
    }

    #[test]
    fn idle_ceiling_never_below_poll_interval() {
        let config = Config {
            poll_interval_ms: Some(60_000),
            max_poll_interval_ms: Some(1_000),
            ..minimal()
        };
        let settings = config.validate().unwrap();
        assert_eq!(
            settings.max_poll_interval, settings.poll_interval,
            "ceiling raised to the first interval"
        );
    }

    #[test]
    fn rejects_zero_finality() {
        let config = Config {
            finality_confirmations: Some(0),
            ..minimal()
        };
        assert!(config.validate().is_err(), "at least one confirmation");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/indexer.toml")).unwrap();
        assert!(config.rpc_urls.is_empty(), "nothing configured");
    }
}
