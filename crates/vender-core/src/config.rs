//! Typed machine configuration.
//!
//! The configuration is a TOML document. Any document may pull in others
//! through `include` entries; included documents are merged on top of the
//! including one in order (tables merge recursively, arrays append,
//! scalars override). Include paths are resolved relative to the including
//! file and a cycle is reported as [`Error::IncludeLoop`].
//!
//! ```toml
//! [engine]
//! on_boot = ["mdb.bus_reset"]
//!
//! [[engine.menu.item]]
//! code = "1"
//! name = "espresso"
//! price = 35
//! scenario = "add.water_hot(60) add.coffee(8)"
//!
//! [[include]]
//! path = "local.toml"
//! optional = true
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::currency::Amount;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub include: Vec<IncludeConfig>,
    pub hardware: HardwareConfig,
    pub engine: EngineConfig,
    pub money: MoneyConfig,
    pub ui: UiConfig,
    pub tele: TeleConfig,
    pub persist: PersistConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncludeConfig {
    pub name: String,
    pub path: String,
    pub optional: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub display: DisplayConfig,
    pub keyboard: KeyboardConfig,
    pub mdb: MdbConfig,
    pub mega: MegaConfig,
    pub input: InputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub enable: bool,
    pub codepage: String,
    pub width: u32,
    pub scroll_delay_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enable: false,
            codepage: "windows-1251".to_string(),
            width: 16,
            scroll_delay_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardConfig {
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MdbConfig {
    /// `file`, `mega` or `helper`.
    pub uart_driver: String,
    pub uart_device: String,
    /// Executable for the `helper` driver.
    pub helper_path: String,
    pub log_debug: bool,
    pub bill: BillConfig,
    pub coin: CoinConfig,
}

impl Default for MdbConfig {
    fn default() -> Self {
        Self {
            uart_driver: "file".to_string(),
            uart_device: "/dev/ttyAMA0".to_string(),
            helper_path: String::new(),
            log_debug: false,
            bill: BillConfig::default(),
            coin: CoinConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillConfig {
    pub enable: bool,
    /// Extra multiplier applied to bill type credits reported by SETUP.
    pub scaling_factor: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoinConfig {
    pub enable: bool,
    pub dispense_timeout_sec: u64,
}

impl Default for CoinConfig {
    fn default() -> Self {
        Self {
            enable: false,
            dispense_timeout_sec: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MegaConfig {
    pub spi: String,
    pub spi_speed: u32,
    pub pin: String,
}

impl Default for MegaConfig {
    fn default() -> Self {
        Self {
            spi: "/dev/spidev0.0".to_string(),
            spi_speed: 200_000,
            pin: "25".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Linux evdev node used as the service button, empty to disable.
    pub dev_input_event_device: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub alias: Vec<AliasConfig>,
    pub on_boot: Vec<String>,
    pub on_menu_error: Vec<String>,
    pub on_service_begin: Vec<String>,
    pub on_service_end: Vec<String>,
    pub on_front_begin: Vec<String>,
    pub on_broken: Vec<String>,
    pub inventory: InventoryConfig,
    pub menu: MenuConfig,
    pub profile: ProfileConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AliasConfig {
    pub name: String,
    pub scenario: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub persist: bool,
    /// Send stock names to telemetry; off saves traffic.
    pub tele_add_name: bool,
    pub stock: Vec<StockConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StockConfig {
    pub name: String,
    pub code: i32,
    pub check: bool,
    pub min: f32,
    pub hw_rate: f32,
    pub spend_rate: f32,
    pub register_add: String,
}

impl std::fmt::Display for StockConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "inventory.{} #{} check={} hw_rate={} spend_rate={} min={}",
            self.name, self.code, self.check, self.hw_rate, self.spend_rate, self.min
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MenuConfig {
    pub item: Vec<MenuItemConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MenuItemConfig {
    pub code: String,
    pub name: String,
    /// Unscaled; multiply by `money.scale`.
    pub price: u32,
    pub scenario: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub regexp: String,
    pub min_us: u64,
    pub log_format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoneyConfig {
    pub scale: u32,
    pub credit_max: u32,
    pub change_over_compensate: u32,
}

impl Default for MoneyConfig {
    fn default() -> Self {
        Self {
            scale: 1,
            credit_max: 0,
            change_over_compensate: 0,
        }
    }
}

impl MoneyConfig {
    /// Apply the configured scale to a raw configured value.
    pub fn scaled(&self, raw: u32) -> Amount {
        Amount(raw.saturating_mul(self.scale.max(1)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub front: FrontConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontConfig {
    pub msg_error: String,
    pub msg_menu_error: String,
    pub msg_broken: String,
    pub msg_locked: String,
    pub msg_intro: String,
    pub msg_wait: String,
    pub msg_cream: String,
    pub msg_sugar: String,
    pub msg_credit: String,
    pub msg_making1: String,
    pub msg_making2: String,
    pub msg_menu_code_empty: String,
    pub msg_menu_code_invalid: String,
    pub msg_menu_insufficient_credit: String,
    pub msg_menu_not_available: String,
    /// Second line while entering a code; `{}` is replaced by the input.
    pub msg_input_code: String,
    pub reset_sec: u64,
    pub tune_timeout_ms: u64,
    pub default_cream: u8,
    pub max_cream: u8,
    pub default_sugar: u8,
    pub max_sugar: u8,
}

impl Default for FrontConfig {
    fn default() -> Self {
        Self {
            msg_error: "error".to_string(),
            msg_menu_error: "please check code".to_string(),
            msg_broken: "broken".to_string(),
            msg_locked: "locked".to_string(),
            msg_intro: "hello".to_string(),
            msg_wait: "please wait".to_string(),
            msg_cream: "Сливки".to_string(),
            msg_sugar: "Сахар".to_string(),
            msg_credit: "Кредит:".to_string(),
            msg_making1: "спасибо".to_string(),
            msg_making2: "готовлю".to_string(),
            msg_menu_code_empty: "нажимайте цифры".to_string(),
            msg_menu_code_invalid: "проверьте код".to_string(),
            msg_menu_insufficient_credit: "добавьте денег".to_string(),
            msg_menu_not_available: "сейчас недоступно".to_string(),
            msg_input_code: "код:{}\0".to_string(),
            reset_sec: 300,
            tune_timeout_ms: 3000,
            default_cream: 4,
            max_cream: 6,
            default_sugar: 4,
            max_sugar: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub auth: ServiceAuthConfig,
    pub msg_auth: String,
    pub reset_sec: u64,
    pub test: Vec<ServiceTestConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            auth: ServiceAuthConfig::default(),
            msg_auth: "password".to_string(),
            reset_sec: 1800,
            test: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceAuthConfig {
    pub enable: bool,
    /// Visual hashes of accepted PINs.
    pub passwords: Vec<String>,
    /// Salt mixed into the visual hash; empty uses `vm_id`.
    pub salt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceTestConfig {
    pub name: String,
    pub scenario: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleConfig {
    pub enable: bool,
    pub vm_id: u32,
    /// `slim` or `none`.
    pub transport: String,
    pub address: String,
    pub secret: String,
    pub log_debug: bool,
    pub keepalive_sec: u64,
    pub network_timeout_sec: u64,
    pub state_interval_sec: u64,
}

impl Default for TeleConfig {
    fn default() -> Self {
        Self {
            enable: false,
            vm_id: 0,
            transport: "slim".to_string(),
            address: String::new(),
            secret: String::new(),
            log_debug: false,
            keepalive_sec: 60,
            network_timeout_sec: 30,
            state_interval_sec: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub root: String,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            root: "/home/vender/persist".to_string(),
        }
    }
}

impl Config {
    /// Parse a single document without following includes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigParse`] on invalid TOML or schema mismatch.
    pub fn parse_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| Error::ConfigParse {
            path: "<string>".to_string(),
            source: e,
        })
    }

    /// Read `path` and every document it includes.
    ///
    /// # Errors
    ///
    /// Returns an error when a file cannot be read or parsed, or when an
    /// include refers back to a document already being loaded.
    pub fn read_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut seen = HashSet::new();
        let value = load_merged(path.as_ref(), &mut seen)?;
        let config: Config = value.try_into().map_err(|e| Error::ConfigParse {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let mut codes = HashSet::new();
        for item in &self.engine.menu.item {
            if item.code.is_empty() {
                return Err(Error::Config("menu item with empty code".to_string()));
            }
            if !codes.insert(item.code.as_str()) {
                return Err(Error::Config(format!("menu item code={} duplicate", item.code)));
            }
        }
        if let Some(s) = self.engine.inventory.stock.iter().find(|s| s.spend_rate < 0.0) {
            return Err(Error::Config(format!("stock={} spend_rate < 0", s.name)));
        }
        if !matches!(self.hardware.mdb.uart_driver.as_str(), "file" | "mega" | "helper") {
            return Err(Error::Config(format!(
                "unknown mdb.uart_driver={} valid: file, mega, helper",
                self.hardware.mdb.uart_driver
            )));
        }
        if self.hardware.display.width as usize > crate::DISPLAY_MAX_WIDTH {
            return Err(Error::Config(format!(
                "hardware.display.width={} above {}",
                self.hardware.display.width,
                crate::DISPLAY_MAX_WIDTH
            )));
        }
        Ok(())
    }

    /// Menu price after scaling.
    pub fn scaled_price(&self, item: &MenuItemConfig) -> Amount {
        self.money.scaled(item.price)
    }
}

fn load_merged(path: &Path, seen: &mut HashSet<PathBuf>) -> Result<toml::Value> {
    let canonical = path.canonicalize()?;
    if !seen.insert(canonical.clone()) {
        return Err(Error::IncludeLoop {
            path: canonical.display().to_string(),
        });
    }
    info!(path = %canonical.display(), "reading config file");
    let text = std::fs::read_to_string(&canonical)?;
    let mut value: toml::Value = toml::from_str(&text).map_err(|e| Error::ConfigParse {
        path: canonical.display().to_string(),
        source: e,
    })?;

    let includes: Vec<IncludeConfig> = match value.get("include") {
        Some(v) => v.clone().try_into().map_err(|e| Error::ConfigParse {
            path: canonical.display().to_string(),
            source: e,
        })?,
        None => Vec::new(),
    };
    if let Some(table) = value.as_table_mut() {
        table.remove("include");
    }

    let base = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
    for include in includes {
        let target = base.join(&include.path);
        if include.optional && !target.exists() {
            debug!(name = %include.name, path = %target.display(), "optional include missing");
            continue;
        }
        let included = load_merged(&target, seen)?;
        merge(&mut value, included);
    }
    seen.remove(&canonical);
    Ok(value)
}

/// Merge `other` into `base`: tables recurse, arrays append, scalars
/// override.
fn merge(base: &mut toml::Value, other: toml::Value) {
    match (base, other) {
        (toml::Value::Table(b), toml::Value::Table(o)) => {
            for (k, v) in o {
                match b.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        b.insert(k, v);
                    }
                }
            }
        }
        (toml::Value::Array(b), toml::Value::Array(o)) => b.extend(o),
        (b, o) => *b = o,
    }
}
