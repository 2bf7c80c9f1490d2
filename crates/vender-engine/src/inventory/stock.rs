use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use futures::future::BoxFuture;
use tracing::debug;
use vender_core::config::StockConfig;

use crate::doer::{Arg, Doer, ExecEnv};
use crate::engine::Engine;
use crate::error::{EngineError, Result};

/// Consumable ingredient tracked in its own units.
pub struct Stock {
    code: u32,
    name: String,
    enabled: AtomicBool,
    check: bool,
    hw_rate: f32,
    spend_rate: f32,
    min: f32,
    value: AtomicU32,
}

/// `arg` in other units; zero stays zero, anything else is at least one.
pub fn translate(arg: Arg, rate: f32) -> f32 {
    if arg == 0 {
        return 0.0;
    }
    let result = (f64::from(arg) * f64::from(rate)).round() as f32;
    if result == 0.0 { 1.0 } else { result }
}

impl Stock {
    /// Build the stock and register `stock.NAME.spend1`,
    /// `stock.NAME.spend(?)` and, with `register_add`, `add.NAME(?)`.
    pub fn new(config: &StockConfig, engine: &Engine) -> Result<Arc<Self>> {
        if config.name.is_empty() {
            return Err(EngineError::config("stock name=(empty) is invalid"));
        }
        if config.spend_rate < 0.0 {
            return Err(EngineError::config(format!(
                "stock={} invalid spend_rate={}",
                config.name, config.spend_rate
            )));
        }
        let code = u32::try_from(config.code).map_err(|_| {
            EngineError::config(format!("stock={} invalid code={}", config.name, config.code))
        })?;
        let stock = Arc::new(Self {
            code,
            name: config.name.clone(),
            enabled: AtomicBool::new(true),
            check: config.check,
            hw_rate: if config.hw_rate == 0.0 { 1.0 } else { config.hw_rate },
            spend_rate: if config.spend_rate == 0.0 { 1.0 } else { config.spend_rate },
            min: config.min,
            value: AtomicU32::new(0f32.to_bits()),
        });

        if !config.register_add.is_empty() {
            let add_name = format!("add.{}(?)", stock.name);
            let inner = engine
                .parse_text(&add_name, &config.register_add)
                .map_err(|e| e.annotate(format!("stock={} register_add", stock.name)))?;
            match inner.apply(engine, 0) {
                Ok(Some(_)) => {}
                Err(e) if e.is_not_resolved() => {}
                Ok(None) | Err(EngineError::ArgNotApplied { .. }) => {
                    return Err(EngineError::config(format!(
                        "stock={} register_add={} no free argument",
                        stock.name, config.register_add
                    )));
                }
                Err(e) => {
                    return Err(e.annotate(format!(
                        "stock={} register_add={}",
                        stock.name, config.register_add
                    )));
                }
            }
            engine.register(add_name, Doer::Stock(StockDoer::new(stock.clone(), inner)))?;
        }

        let s = stock.clone();
        engine.register(
            format!("stock.{}.spend1", stock.name),
            Doer::func(format!("stock.{}.spend1", stock.name), move |_| {
                s.spend_value(s.translate_spend(1));
                async { Ok(()) }
            }),
        )?;
        let s = stock.clone();
        engine.register(
            format!("stock.{}.spend(?)", stock.name),
            Doer::func_arg(format!("stock.{}.spend(?)", stock.name), move |_, arg| {
                s.spend_value(s.translate_spend(arg));
                async { Ok(()) }
            }),
        )?;
        Ok(stock)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn value(&self) -> f32 {
        f32::from_bits(self.value.load(Ordering::Acquire))
    }

    pub fn set(&self, v: f32) {
        self.value.store(v.to_bits(), Ordering::Release);
    }

    pub fn has(&self, v: f32) -> bool {
        self.value() - v >= self.min
    }

    pub fn translate_hw(&self, arg: Arg) -> f32 {
        translate(arg, self.hw_rate)
    }

    pub fn translate_spend(&self, arg: Arg) -> f32 {
        translate(arg, self.spend_rate)
    }

    fn spend_value(&self, v: f32) {
        if !self.enabled() {
            return;
        }
        let _ = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f32::from_bits(bits) - v).to_bits())
            });
    }
}

impl fmt::Display for Stock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stock(name={} value={})", self.name, self.value())
    }
}

impl fmt::Debug for Stock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stock")
            .field("name", &self.name)
            .field("code", &self.code)
            .field("enabled", &self.enabled())
            .field("value", &self.value())
            .finish()
    }
}

/// `add.NAME(?)`: the `register_add` scenario with a stock check before
/// and the spend after.
#[derive(Clone)]
pub struct StockDoer {
    stock: Arc<Stock>,
    before: Box<Doer>,
    after: Option<Box<Doer>>,
    arg: Arg,
    spend: f32,
}

impl StockDoer {
    fn new(stock: Arc<Stock>, before: Doer) -> Self {
        Self {
            stock,
            before: Box::new(before),
            after: None,
            arg: 0,
            spend: 0.0,
        }
    }

    pub(crate) fn apply(&self, engine: &Engine, arg: Arg) -> Result<Doer> {
        if self.after.is_some() {
            return Err(EngineError::ArgOverwrite {
                action: self.to_string(),
            });
        }
        self.bind(engine, arg)
    }

    fn bind(&self, engine: &Engine, arg: Arg) -> Result<Doer> {
        let hw = self.stock.translate_hw(arg) as Arg;
        let Some(after) = self.before.apply(engine, hw)? else {
            return Err(EngineError::ArgNotApplied {
                action: format!("stock={}", self.stock.name),
            });
        };
        Ok(Doer::Stock(Self {
            stock: self.stock.clone(),
            before: self.before.clone(),
            after: Some(Box::new(after)),
            arg,
            spend: self.stock.translate_spend(arg),
        }))
    }

    fn after(&self) -> Result<&Doer> {
        self.after.as_deref().ok_or_else(|| EngineError::ArgMissing {
            action: self.to_string(),
        })
    }

    fn check(&self) -> Result<()> {
        if self.stock.enabled() && self.stock.check && !self.stock.has(self.spend) {
            return Err(EngineError::StockLow {
                stock: self.stock.name.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn validate(&self, engine: &Engine) -> Result<()> {
        self.after()?
            .validate(engine)
            .map_err(|e| e.annotate(format!("stock={}", self.stock.name)))?;
        self.check()
    }

    pub(crate) fn run<'a>(
        &'a self,
        engine: &'a Engine,
        env: &'a ExecEnv,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some(rate) = env.tuning.get(&self.stock.name) {
                let tuned = (f64::from(self.arg) * f64::from(*rate)).round() as Arg;
                debug!(stock = %self.stock.name, arg = self.arg, tuned, "stock tuned");
                let d = self.bind(engine, tuned).map_err(|e| {
                    e.annotate(format!("stock={} tuned_arg={tuned}", self.stock.name))
                })?;
                let mut inner = env.clone();
                inner.tuning.remove(&self.stock.name);
                return engine.exec_part(&inner, &d).await;
            }

            let after = self.after()?;
            self.check()?;
            after
                .validate(engine)
                .map_err(|e| e.annotate(format!("stock={}", self.stock.name)))?;
            engine.exec_part(env, after).await?;
            self.stock.spend_value(self.spend);
            Ok(())
        })
    }
}

impl fmt::Display for StockDoer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stock.{}({})", self.stock.name, self.arg)
    }
}
