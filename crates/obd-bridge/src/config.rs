//! Bridge configuration
//!
//! An optional TOML file layered under `OBD_BRIDGE__`-prefixed environment
//! variables, e.g. `OBD_BRIDGE__ADDRESS=tcp://192.168.0.10:35000` or
//! `OBD_BRIDGE__LINK__BAUD_RATE=115200`.

use crate::error::BridgeError;
use config::{Config, Environment, File, FileFormat};
use elm_link::LinkConfig;
use obd_session::{SessionConfig, SessionKind, StaticLookup};
use packet_decoder::{BitRange, DataPointDef, FormulaProgram, SniffRule};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "obd-bridge.toml";
const ENV_PREFIX: &str = "OBD_BRIDGE";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Adapter address: a serial device path or `tcp://host:port`
    pub address: String,
    pub link: LinkConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
    /// Period of the OBD2 polling loop (milliseconds)
    pub poll_interval_ms: u64,
    /// Session given the link at startup
    pub active_session: SessionKind,
    /// Data points polled while the OBD2 session is active. Empty polls the
    /// whole catalog.
    pub poll: Vec<String>,
    pub data_points: Vec<DataPointDef>,
    pub sniff_rules: Vec<SniffRuleEntry>,
    /// Command macros by name
    pub macros: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of the human formatter
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// One sniff rule together with the bus and header it applies to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SniffRuleEntry {
    #[serde(default = "default_network")]
    pub network: String,
    pub header: String,
    #[serde(default)]
    pub prefix: String,
    pub name: String,
    pub formula: FormulaProgram,
    #[serde(default)]
    pub bits: Option<BitRange>,
}

fn default_network() -> String {
    "default".to_string()
}

impl SniffRuleEntry {
    pub fn rule(&self) -> SniffRule {
        SniffRule {
            prefix: self.prefix.clone(),
            name: self.name.clone(),
            formula: self.formula.clone(),
            bits: self.bits,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: "/dev/rfcomm0".to_string(),
            link: LinkConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
            poll_interval_ms: 1000,
            active_session: SessionKind::Obd2,
            poll: Vec::new(),
            data_points: default_data_points(),
            sniff_rules: Vec::new(),
            macros: BTreeMap::new(),
        }
    }
}

fn default_data_points() -> Vec<DataPointDef> {
    let standard = [
        ("rpm", "010C", "A*256,X+B,X/4"),
        ("speed", "010D", "A"),
        ("coolant", "0105", "A-40"),
        ("voltage", "ATRV", "AT"),
    ];
    standard
        .iter()
        .filter_map(|(name, request, formula)| {
            FormulaProgram::parse(formula)
                .ok()
                .map(|program| DataPointDef::new(name, request, program))
        })
        .collect()
}

impl BridgeConfig {
    /// Load from `path` (missing file is fine) and the environment.
    pub fn load(path: &str) -> Result<Self, BridgeError> {
        let settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(environment())
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse TOML text, without the environment layer
    pub fn from_toml(text: &str) -> Result<Self, BridgeError> {
        let settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Names polled by the OBD2 loop, in catalog order when `poll` is empty
    pub fn poll_names(&self) -> Vec<String> {
        if self.poll.is_empty() {
            self.data_points.iter().map(|def| def.name.clone()).collect()
        } else {
            self.poll.clone()
        }
    }

    /// In-memory catalog built from the configured definitions
    pub fn catalog(&self) -> StaticLookup {
        let mut lookup = StaticLookup::new();
        for def in &self.data_points {
            lookup = lookup.with_data_point(def.clone());
        }
        for entry in &self.sniff_rules {
            lookup = lookup.with_sniff_rule(&entry.network, &entry.header, entry.rule());
        }
        for (name, text) in &self.macros {
            lookup = lookup.with_macro(name, text);
        }
        lookup
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
