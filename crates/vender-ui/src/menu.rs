use std::collections::BTreeMap;

use tracing::debug;
use vender_core::{Amount, Config};
use vender_engine::{Doer, Engine};

use crate::error::{Result, UiError};

#[derive(Debug, Clone)]
pub struct MenuItem {
    pub code: String,
    pub name: String,
    /// Already scaled by `money.scale`.
    pub price: Amount,
    pub doer: Doer,
}

/// Menu items by code.
#[derive(Debug, Default)]
pub struct Menu {
    items: BTreeMap<String, MenuItem>,
}

impl Menu {
    /// Parse every `engine.menu.item` scenario. Unknown actions resolve
    /// lazily, so items may refer to actions registered later.
    ///
    /// # Errors
    ///
    /// Empty or duplicate codes and scenario parse errors.
    pub fn init(config: &Config, engine: &Engine) -> Result<Self> {
        let mut items = BTreeMap::new();
        for c in &config.engine.menu.item {
            if c.code.is_empty() {
                return Err(UiError::config(format!("menu item name={} without code", c.name)));
            }
            let doer = engine.parse_text(&format!("menu:{}", c.code), &c.scenario)?;
            let item = MenuItem {
                code: c.code.clone(),
                name: c.name.clone(),
                price: config.scaled_price(c),
                doer,
            };
            if items.insert(c.code.clone(), item).is_some() {
                return Err(UiError::config(format!("menu code={} duplicate", c.code)));
            }
        }
        debug!(items = items.len(), "menu loaded");
        Ok(Self { items })
    }

    pub fn get(&self, code: &str) -> Option<&MenuItem> {
        self.items.get(code)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MenuItem> {
        self.items.values()
    }

    /// Highest price among items that currently validate.
    ///
    /// # Errors
    ///
    /// [`UiError::Menu`] when no item validates.
    pub fn max_price(&self, engine: &Engine) -> Result<Amount> {
        let mut max = None;
        for item in self.items.values() {
            match item.doer.validate(engine) {
                Ok(()) => max = Some(max.unwrap_or(Amount::ZERO).max(item.price)),
                Err(e) => debug!(code = %item.code, error = %e, "menu item unavailable"),
            }
        }
        max.ok_or_else(|| UiError::menu("no valid items"))
    }
}
