//! Ingredient stocks.
//!
//! Each configured stock registers engine actions that consume it, so a
//! scenario such as `add.sugar(4)` checks the level first and subtracts
//! only after the hardware action succeeded.

mod state;
mod stock;

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, info, warn};
use vender_core::config::InventoryConfig;
use vender_protocol::tele;
use vender_storage::Persist;

use crate::doer::ExecEnv;
use crate::engine::Engine;
use crate::error::{EngineError, Result};

pub use state::StockState;
pub use stock::{Stock, StockDoer, translate};

#[derive(Debug, Default)]
pub struct Inventory {
    stocks: RwLock<Vec<Arc<Stock>>>,
    tele_add_name: bool,
    persist: Option<Persist>,
}

impl Inventory {
    /// Build stocks in config order and register their actions.
    ///
    /// # Errors
    ///
    /// Invalid stock config, a repeated name or an action name collision.
    pub fn init(config: &InventoryConfig, engine: &Engine) -> Result<Self> {
        let mut stocks: Vec<Arc<Stock>> = Vec::with_capacity(config.stock.len());
        for sc in &config.stock {
            if stocks.iter().any(|s| s.name() == sc.name) {
                return Err(EngineError::config(format!("stock={} duplicate name", sc.name)));
            }
            let stock = Stock::new(sc, engine)?;
            if stock.code() != 0
                && let Some(other) = stocks.iter().find(|s| s.code() == stock.code())
            {
                warn!(
                    code = stock.code(),
                    first = %other.name(),
                    second = %stock.name(),
                    "stock duplicate code"
                );
            }
            debug!(stock = %sc, "inventory stock");
            stocks.push(stock);
        }
        Ok(Self {
            stocks: RwLock::new(stocks),
            tele_add_name: config.tele_add_name,
            persist: None,
        })
    }

    /// Attach the state file used by [`Inventory::load`] and
    /// [`Inventory::store`].
    #[must_use]
    pub fn with_persist(mut self, persist: Persist) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<Stock>> {
        self.read().iter().find(|s| s.name() == name).cloned()
    }

    pub fn must_get(&self, name: &str) -> Result<Arc<Stock>> {
        self.get(name).ok_or_else(|| EngineError::UnknownStock {
            name: name.to_string(),
            code: 0,
        })
    }

    /// Visit every stock while holding the write lock.
    pub fn iter(&self, mut f: impl FnMut(&Stock)) {
        let stocks = self.stocks.write().unwrap_or_else(PoisonError::into_inner);
        for s in stocks.iter() {
            f(s);
        }
    }

    pub fn enable_all(&self) {
        self.iter(Stock::enable);
    }

    pub fn disable_all(&self) {
        self.iter(Stock::disable);
    }

    /// Scale the next use of stock `name` within `env` by `factor`.
    pub fn with_tuning(&self, env: &mut ExecEnv, name: &str, factor: f32) -> Result<()> {
        let stock = self.must_get(name)?;
        env.tuning.insert(stock.name().to_string(), factor);
        Ok(())
    }

    /// Enabled stocks ordered by code, then name.
    pub fn tele(&self) -> tele::Inventory {
        let mut stocks: Vec<tele::StockItem> = self
            .read()
            .iter()
            .filter(|s| s.enabled())
            .map(|s| tele::StockItem {
                code: s.code(),
                name: if self.tele_add_name {
                    s.name().to_string()
                } else {
                    String::new()
                },
                value: s.value() as i32,
                valuef: s.value(),
            })
            .collect();
        stocks.sort_by(|a, b| a.code.cmp(&b.code).then_with(|| a.name.cmp(&b.name)));
        tele::Inventory { stocks }
    }

    fn lookup(stocks: &[Arc<Stock>], item: &tele::StockItem) -> Option<Arc<Stock>> {
        stocks
            .iter()
            .find(|s| {
                if item.name.is_empty() {
                    s.code() == item.code
                } else {
                    s.name() == item.name
                }
            })
            .cloned()
    }

    /// Set stock values from a remote list. Nothing changes unless every
    /// item names a known stock.
    pub fn set_tele(&self, new: &tele::Inventory) -> Result<()> {
        let stocks = self.stocks.write().unwrap_or_else(PoisonError::into_inner);
        let mut found = Vec::with_capacity(new.stocks.len());
        let mut errs = Vec::new();
        for item in &new.stocks {
            match Self::lookup(&stocks, item) {
                Some(s) => found.push((s, item.valuef)),
                None => {
                    let e = EngineError::UnknownStock {
                        name: item.name.clone(),
                        code: item.code,
                    };
                    error!(error = %e, "inventory set_tele");
                    errs.push(e);
                }
            }
        }
        EngineError::fold(errs)?;
        for (s, v) in found {
            info!(stock = %s.name(), old = s.value(), new = v, "inventory set");
            s.set(v);
        }
        Ok(())
    }

    pub fn state(&self) -> Vec<StockState> {
        self.read()
            .iter()
            .map(|s| StockState {
                name: s.name().to_string(),
                enabled: s.enabled(),
                value: s.value(),
            })
            .collect()
    }

    pub fn apply_state(&self, states: &[StockState]) {
        for st in states {
            match self.get(&st.name) {
                Some(s) => {
                    if st.enabled {
                        s.enable();
                    } else {
                        s.disable();
                    }
                    s.set(st.value);
                }
                None => debug!(stock = %st.name, "stored stock unknown, skipped"),
            }
        }
    }

    /// Restore values from the state file. No-op without persistence or
    /// with nothing stored.
    pub fn load(&self) -> Result<()> {
        let Some(p) = &self.persist else {
            return Ok(());
        };
        let Some(raw) = p
            .load()
            .map_err(|e| EngineError::action("inventory.load", e))?
        else {
            info!("inventory state empty");
            return Ok(());
        };
        self.apply_state(&state::decode(&raw)?);
        Ok(())
    }

    pub fn store(&self) -> Result<()> {
        let Some(p) = &self.persist else {
            return Ok(());
        };
        p.store(&state::encode(&self.state()))
            .map_err(|e| EngineError::action("inventory.store", e))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Stock>>> {
        self.stocks.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vender_core::config::StockConfig;

    fn stock(name: &str, code: i32, min: f32) -> StockConfig {
        StockConfig {
            name: name.into(),
            code,
            min,
            ..StockConfig::default()
        }
    }

    fn tele_inventory() -> (Engine, Inventory) {
        let e = Engine::new();
        let config = InventoryConfig {
            persist: false,
            tele_add_name: true,
            stock: vec![stock("drink", 7, 0.0), stock("snack", 0, 1.0), stock("water", 0, 0.5)],
        };
        let inv = Inventory::init(&config, &e).unwrap();
        (e, inv)
    }

    fn item(code: u32, name: &str, valuef: f32) -> tele::StockItem {
        tele::StockItem {
            code,
            name: name.into(),
            value: valuef as i32,
            valuef,
        }
    }

    #[test]
    fn test_tele_order_and_set() {
        let (_e, inv) = tele_inventory();
        inv.must_get("water").unwrap().set(1.8);
        let expect1 = vec![item(0, "snack", 0.0), item(0, "water", 1.8), item(7, "drink", 0.0)];
        assert_eq!(inv.tele().stocks, expect1);

        let err = inv
            .set_tele(&tele::Inventory {
                stocks: vec![item(7, "", 5.0), item(0, "missing", 0.0)],
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "stock name=missing code=0 not found");
        assert_eq!(inv.tele().stocks, expect1);

        inv.set_tele(&tele::Inventory {
            stocks: vec![item(7, "", 2.0)],
        })
        .unwrap();
        assert_eq!(inv.tele().stocks[2], item(7, "drink", 2.0));

        inv.set_tele(&tele::Inventory {
            stocks: vec![item(0, "snack", 4.2), item(0, "water", 0.0)],
        })
        .unwrap();
        assert_eq!(
            inv.tele().stocks,
            vec![item(0, "snack", 4.2), item(0, "water", 0.0), item(7, "drink", 2.0)]
        );
    }

    #[test]
    fn test_tele_hides_names_and_disabled() {
        let e = Engine::new();
        let config = InventoryConfig {
            stock: vec![stock("cup", 1, 0.0), stock("lid", 2, 0.0)],
            ..InventoryConfig::default()
        };
        let inv = Inventory::init(&config, &e).unwrap();
        inv.must_get("lid").unwrap().disable();
        assert_eq!(inv.tele().stocks, vec![item(1, "", 0.0)]);
        inv.enable_all();
        assert_eq!(inv.tele().stocks.len(), 2);
        inv.disable_all();
        assert!(inv.tele().stocks.is_empty());
    }

    #[test]
    fn test_duplicate_name() {
        let e = Engine::new();
        let config = InventoryConfig {
            stock: vec![stock("cup", 1, 0.0), stock("cup", 2, 0.0)],
            ..InventoryConfig::default()
        };
        assert!(Inventory::init(&config, &e).is_err());
    }

    #[test]
    fn test_with_tuning_unknown() {
        let (_e, inv) = tele_inventory();
        let mut env = ExecEnv::new();
        inv.with_tuning(&mut env, "water", 1.5).unwrap();
        assert_eq!(env.tuning.get("water"), Some(&1.5));
        assert!(matches!(
            inv.with_tuning(&mut env, "tea", 1.0),
            Err(EngineError::UnknownStock { .. })
        ));
    }

    #[test]
    fn test_persist_roundtrip_skips_unknown() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_str().unwrap();
        {
            let (_e, inv) = tele_inventory();
            let inv = inv.with_persist(Persist::new(root, "inventory", true).unwrap());
            inv.must_get("snack").unwrap().set(12.5);
            inv.must_get("drink").unwrap().disable();
            inv.store().unwrap();
        }
        let e = Engine::new();
        let config = InventoryConfig {
            stock: vec![stock("snack", 0, 0.0), stock("drink", 7, 0.0)],
            ..InventoryConfig::default()
        };
        let inv = Inventory::init(&config, &e)
            .unwrap()
            .with_persist(Persist::new(root, "inventory", true).unwrap());
        inv.load().unwrap();
        assert_eq!(inv.must_get("snack").unwrap().value(), 12.5);
        assert!(!inv.must_get("drink").unwrap().enabled());
    }
}
