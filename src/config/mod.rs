//! Configuration for postage-gateway.

pub mod units;

use crate::error::{Error, Result};
use crate::stamp::{AutobuyMode, ExtendMode, ManagerMode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;
use units::{parse_amount, parse_batch_id, parse_depth, parse_duration, parse_percentage, UnitValue};

/// Gateway configuration, as stored in the TOML settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Connection to the storage node.
    #[serde(default)]
    pub bee: BeeConfig,

    /// HTTP front settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Postage stamp management.
    #[serde(default)]
    pub stamp: StampSettings,
}

/// Connection to the storage node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeeConfig {
    /// Base URL of the node API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Timeout of forwarded requests (e.g. `"20m"`).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: UnitValue,
}

impl Default for BeeConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl BeeConfig {
    /// Timeout of forwarded requests.
    ///
    /// # Errors
    ///
    /// Returns an error if `request_timeout` is not a valid duration.
    pub fn request_timeout(&self) -> Result<Duration> {
        parse_duration(&self.request_timeout, "bee.request_timeout")
    }
}

/// HTTP front settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to listen on.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// When set, every request must carry `Authorization: <secret>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<String>,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Strip the `swarm-pin` header from forwarded requests, so public
    /// users cannot fill the node's disk with pinned content.
    #[serde(default = "default_remove_pin_header")]
    pub remove_pin_header: bool,

    /// Make `/readiness` probe the node instead of always answering OK.
    #[serde(default)]
    pub readiness_check: bool,

    /// Largest request body forwarded to the node, in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            auth_secret: None,
            log_level: default_log_level(),
            remove_pin_header: default_remove_pin_header(),
            readiness_check: false,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Which stamp management mode runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StampModeKind {
    /// No stamp management; writes are forwarded untouched.
    #[default]
    #[serde(rename = "")]
    Disabled,
    /// Always use one configured stamp.
    Hardcoded,
    /// Buy stamps as existing ones fill up or expire.
    Autobuy,
    /// Top up and dilute existing stamps.
    Extend,
}

/// `[stamp]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StampSettings {
    /// Active mode.
    #[serde(default)]
    pub mode: StampModeKind,

    /// Settings of the hardcoded mode.
    #[serde(default)]
    pub hardcoded: HardcodedSettings,

    /// Settings of the autobuy mode.
    #[serde(default)]
    pub autobuy: AutobuySettings,

    /// Settings of the extend mode.
    #[serde(default)]
    pub extend: ExtendSettings,
}

/// `[stamp.hardcoded]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardcodedSettings {
    /// Stamp to attach to every write.
    #[serde(default)]
    pub batch_id: String,
}

/// `[stamp.autobuy]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutobuySettings {
    /// Depth of purchased stamps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<UnitValue>,

    /// Amount of purchased stamps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<UnitValue>,

    /// Stamps at or above this usage are not used.
    #[serde(default = "default_usage_max")]
    pub usage_max: UnitValue,

    /// Buy when the least used stamp is above this usage.
    #[serde(default = "default_usage_threshold")]
    pub usage_threshold: UnitValue,

    /// Stamps with less TTL are not used. Defaults to five refresh periods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_min: Option<UnitValue>,

    /// Time between checks.
    #[serde(default = "default_refresh_period")]
    pub refresh_period: UnitValue,
}

impl Default for AutobuySettings {
    fn default() -> Self {
        Self {
            depth: None,
            amount: None,
            usage_max: default_usage_max(),
            usage_threshold: default_usage_threshold(),
            ttl_min: None,
            refresh_period: default_refresh_period(),
        }
    }
}

impl AutobuySettings {
    fn to_mode(&self) -> Result<AutobuyMode> {
        let refresh_period = parse_duration(&self.refresh_period, "stamp.autobuy.refresh_period")?;
        let ttl_min = match &self.ttl_min {
            Some(value) => parse_duration(value, "stamp.autobuy.ttl_min")?,
            None => refresh_period * 5,
        };

        Ok(AutobuyMode {
            depth: parse_depth(
                required(&self.depth, "stamp.autobuy.depth")?,
                "stamp.autobuy.depth",
            )?,
            amount: parse_amount(
                required(&self.amount, "stamp.autobuy.amount")?,
                "stamp.autobuy.amount",
            )?,
            usage_max: parse_percentage(&self.usage_max, "stamp.autobuy.usage_max")?,
            usage_threshold: parse_percentage(
                &self.usage_threshold,
                "stamp.autobuy.usage_threshold",
            )?,
            ttl_min,
            refresh_period,
        })
    }
}

/// `[stamp.extend]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendSettings {
    /// Top up stamps whose TTL runs low.
    #[serde(default = "default_enable_ttl")]
    pub enable_ttl: bool,

    /// Dilute stamps whose usage runs high.
    #[serde(default)]
    pub enable_capacity: bool,

    /// Depth of the stamp bought when none is usable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<UnitValue>,

    /// Amount of the stamp bought when none is usable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<UnitValue>,

    /// Amount added per TTL top-up. Defaults to `amount`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topup_amount: Option<UnitValue>,

    /// Top up when TTL falls below this. At least 60s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_min: Option<UnitValue>,

    /// Dilute when usage rises above this.
    #[serde(default = "default_usage_threshold")]
    pub usage_threshold: UnitValue,

    /// Time between checks.
    #[serde(default = "default_refresh_period")]
    pub refresh_period: UnitValue,
}

impl Default for ExtendSettings {
    fn default() -> Self {
        Self {
            enable_ttl: default_enable_ttl(),
            enable_capacity: false,
            depth: None,
            amount: None,
            topup_amount: None,
            ttl_min: None,
            usage_threshold: default_usage_threshold(),
            refresh_period: default_refresh_period(),
        }
    }
}

impl ExtendSettings {
    fn to_mode(&self) -> Result<ExtendMode> {
        let amount = parse_amount(
            required(&self.amount, "stamp.extend.amount")?,
            "stamp.extend.amount",
        )?;
        let topup_amount = match &self.topup_amount {
            Some(value) => parse_amount(value, "stamp.extend.topup_amount")?,
            None => amount.clone(),
        };
        let ttl_min = match &self.ttl_min {
            Some(value) => parse_duration(value, "stamp.extend.ttl_min")?,
            None if self.enable_ttl => {
                return Err(Error::Config(
                    "stamp.extend.ttl_min is required when enable_ttl is set (at least 60s)"
                        .into(),
                ))
            }
            None => Duration::ZERO,
        };

        Ok(ExtendMode {
            enable_ttl: self.enable_ttl,
            enable_capacity: self.enable_capacity,
            depth: parse_depth(
                required(&self.depth, "stamp.extend.depth")?,
                "stamp.extend.depth",
            )?,
            amount,
            topup_amount,
            ttl_min,
            usage_threshold: parse_percentage(
                &self.usage_threshold,
                "stamp.extend.usage_threshold",
            )?,
            refresh_period: parse_duration(&self.refresh_period, "stamp.extend.refresh_period")?,
        })
    }
}

impl StampSettings {
    /// Build the manager mode, or `None` when stamp management is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a value cannot be parsed or the resulting
    /// mode is inconsistent.
    pub fn to_mode(&self) -> Result<Option<ManagerMode>> {
        let mode = match self.mode {
            StampModeKind::Disabled => return Ok(None),
            StampModeKind::Hardcoded => ManagerMode::Hardcoded(parse_batch_id(
                &self.hardcoded.batch_id,
                "stamp.hardcoded.batch_id",
            )?),
            StampModeKind::Autobuy => ManagerMode::Autobuy(self.autobuy.to_mode()?),
            StampModeKind::Extend => ManagerMode::Extend(self.extend.to_mode()?),
        };

        mode.validate()?;
        Ok(Some(mode))
    }
}

fn required<'a>(value: &'a Option<UnitValue>, field: &str) -> Result<&'a UnitValue> {
    value
        .as_ref()
        .ok_or_else(|| Error::Config(format!("{field} is required for this stamp mode")))
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from `path`, writing the defaults there first if
    /// the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or created.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::from_file(path);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let config = Self::default();
        config.to_file(path)?;
        info!("Wrote default configuration to {}", path.display());
        Ok(config)
    }
}

fn default_api_url() -> String {
    "http://localhost:1633".to_string()
}

fn default_request_timeout() -> UnitValue {
    UnitValue::from("20m")
}

fn default_hostname() -> String {
    "localhost".to_string()
}

const fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_max_body_bytes() -> usize {
    1 << 30
}

const fn default_remove_pin_header() -> bool {
    true
}

const fn default_enable_ttl() -> bool {
    true
}

fn default_usage_max() -> UnitValue {
    UnitValue::from("90%")
}

fn default_usage_threshold() -> UnitValue {
    UnitValue::from("70%")
}

fn default_refresh_period() -> UnitValue {
    UnitValue::from("60s")
}
