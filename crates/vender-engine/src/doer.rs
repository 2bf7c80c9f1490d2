//! Doers: the nodes of a scenario graph.
//!
//! ```text
//!   "add.tea(15) { cup sugar } water"
//!
//!   Seq(menu:1)
//!    |- Lazy(add.tea(15)) ..> Stock(tea) -> FuncArg(tea.drop:19)
//!    |- Parallel({cup sugar})
//!    |    |- Func(cup)
//!    |    `- Lazy(sugar)
//!    `- Func(water)
//! ```
//!
//! A doer is a value. Binding an argument with [`Doer::apply`] returns a
//! new doer and leaves the registered one untouched.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use tracing::debug;
use vender_core::Amount;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::inventory::StockDoer;

/// Integer argument bound into a `(?)` placeholder.
pub type Arg = i32;

pub type DoFuture = BoxFuture<'static, Result<()>>;
type FuncFn = Arc<dyn Fn(ExecEnv) -> DoFuture + Send + Sync>;
type ArgFn = Arc<dyn Fn(ExecEnv, Arg) -> DoFuture + Send + Sync>;
pub type Validator = Arc<dyn Fn() -> Result<()> + Send + Sync>;
pub type RestartCheck = Arc<dyn Fn(&EngineError) -> bool + Send + Sync>;

/// Values visible to every doer of one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecEnv {
    /// Price of the item being made, zero outside of a sale.
    pub price: Amount,
    /// Stock name to multiplier, consumed by stock doers.
    pub tuning: HashMap<String, f32>,
}

impl ExecEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(price: Amount) -> Self {
        Self {
            price,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct Func {
    name: String,
    f: FuncFn,
    validator: Option<Validator>,
}

impl Func {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ExecEnv) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(move |env| Box::pin(f(env))),
            validator: None,
        }
    }

    #[must_use]
    pub fn with_validator(mut self, v: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(v));
        self
    }
}

/// Callable taking one [`Arg`], unbound until applied.
#[derive(Clone)]
pub struct FuncArg {
    name: String,
    f: ArgFn,
    validator: Option<Validator>,
    arg: Option<Arg>,
}

impl FuncArg {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ExecEnv, Arg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(move |env, arg| Box::pin(f(env, arg))),
            validator: None,
            arg: None,
        }
    }

    #[must_use]
    pub fn with_validator(mut self, v: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(v));
        self
    }

    pub fn arg(&self) -> Option<Arg> {
        self.arg
    }
}

/// Named list of doers, used both for serial and parallel composition.
#[derive(Clone)]
pub struct Seq {
    name: String,
    items: Vec<Doer>,
}

impl Seq {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, d: Doer) {
        self.items.push(d);
    }

    pub fn items(&self) -> &[Doer] {
        &self.items
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind `arg` into the first child that takes it.
    fn apply(&self, engine: &Engine, arg: Arg) -> Result<Option<Seq>> {
        let mut items = Vec::with_capacity(self.items.len());
        let mut found = false;
        for child in &self.items {
            if found {
                items.push(child.clone());
                continue;
            }
            match child.apply(engine, arg) {
                Ok(Some(applied)) => {
                    found = true;
                    items.push(applied);
                }
                Ok(None) => items.push(child.clone()),
                Err(e)
                    if matches!(
                        e.root(),
                        EngineError::ArgOverwrite { .. } | EngineError::ArgNotApplied { .. }
                    ) =>
                {
                    items.push(child.clone());
                }
                Err(e) => return Err(e.annotate(format!("seq={}", self.name))),
            }
        }
        if !found {
            return Err(EngineError::ArgNotApplied {
                action: self.name.clone(),
            });
        }
        Ok(Some(Seq {
            name: self.name.clone(),
            items,
        }))
    }

    fn validate(&self, engine: &Engine) -> Result<()> {
        let errs = self
            .items
            .iter()
            .filter_map(|d| {
                d.validate(engine)
                    .err()
                    .map(|e| e.annotate(format!("seq={} node={} validate", self.name, d)))
            })
            .collect();
        EngineError::fold(errs)
    }
}

#[derive(Clone)]
pub struct Restart {
    doer: Box<Doer>,
    check: RestartCheck,
    reset: Box<Doer>,
}

/// Executable node of a scenario.
#[derive(Clone)]
pub enum Doer {
    Func(Func),
    FuncArg(FuncArg),
    Seq(Seq),
    Parallel(Seq),
    RepeatN { n: u32, doer: Box<Doer> },
    Sleep(Duration),
    Nothing(String),
    Fail(EngineError),
    /// Name resolved against the engine on every use.
    Lazy(String),
    /// Takes an argument and drops it.
    IgnoreArg(Box<Doer>),
    Restart(Restart),
    Stock(StockDoer),
}

impl Doer {
    pub fn func<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ExecEnv) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::Func(Func::new(name, f))
    }

    pub fn func_arg<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ExecEnv, Arg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::FuncArg(FuncArg::new(name, f))
    }

    pub fn nothing(name: impl Into<String>) -> Self {
        Self::Nothing(name.into())
    }

    pub fn seq(name: impl Into<String>, items: Vec<Doer>) -> Self {
        Self::Seq(Seq {
            name: name.into(),
            items,
        })
    }

    pub fn parallel(name: impl Into<String>, items: Vec<Doer>) -> Self {
        Self::Parallel(Seq {
            name: name.into(),
            items,
        })
    }

    pub fn repeat(n: u32, doer: Doer) -> Self {
        Self::RepeatN {
            n,
            doer: Box::new(doer),
        }
    }

    /// Run `doer`; when it fails with an error accepted by `check`, run
    /// `reset` and try `doer` once more.
    pub fn restart(
        doer: Doer,
        check: impl Fn(&EngineError) -> bool + Send + Sync + 'static,
        reset: Doer,
    ) -> Self {
        Self::Restart(Restart {
            doer: Box::new(doer),
            check: Arc::new(check),
            reset: Box::new(reset),
        })
    }

    pub fn validate(&self, engine: &Engine) -> Result<()> {
        match self {
            Self::Func(f) => f.validator.as_ref().map_or(Ok(()), |v| v()),
            Self::FuncArg(f) => {
                if f.arg.is_none() {
                    return Err(EngineError::ArgMissing {
                        action: f.name.clone(),
                    });
                }
                f.validator.as_ref().map_or(Ok(()), |v| v())
            }
            Self::Seq(seq) | Self::Parallel(seq) => seq.validate(engine),
            Self::RepeatN { doer, .. } => doer.validate(engine),
            Self::IgnoreArg(doer) => Err(EngineError::ArgMissing {
                action: doer.to_string(),
            }),
            Self::Restart(r) => r.doer.validate(engine),
            Self::Sleep(_) | Self::Nothing(_) => Ok(()),
            Self::Fail(e) => Err(e.clone()),
            Self::Lazy(name) => engine.resolve(name)?.validate(engine),
            Self::Stock(s) => s.validate(engine),
        }
    }

    /// Execute without validation.
    pub fn run<'a>(&'a self, engine: &'a Engine, env: &'a ExecEnv) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self {
                Self::Func(f) => (f.f)(env.clone()).await,
                Self::FuncArg(f) => match f.arg {
                    Some(arg) => (f.f)(env.clone(), arg).await,
                    None => Err(EngineError::ArgMissing {
                        action: f.name.clone(),
                    }),
                },
                Self::Seq(seq) => {
                    for d in &seq.items {
                        engine.exec_part(env, d).await?;
                    }
                    Ok(())
                }
                Self::Parallel(seq) => {
                    let results = join_all(seq.items.iter().map(|d| engine.exec_part(env, d))).await;
                    EngineError::fold(results.into_iter().filter_map(Result::err).collect())
                }
                Self::RepeatN { n, doer } => {
                    for i in 1..=*n {
                        debug!("engine loop {i}/{n}");
                        doer.run(engine, env).await?;
                    }
                    Ok(())
                }
                Self::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(())
                }
                Self::Nothing(_) => Ok(()),
                Self::Fail(e) => Err(e.clone()),
                Self::Lazy(name) => {
                    let d = engine.resolve(name)?;
                    d.run(engine, env).await
                }
                Self::IgnoreArg(doer) => doer.run(engine, env).await,
                Self::Restart(r) => {
                    let first = match engine.exec_part(env, &r.doer).await {
                        Ok(()) => return Ok(()),
                        Err(e) => e,
                    };
                    if !(r.check)(&first) {
                        return Err(first);
                    }
                    debug!(doer = %r.doer, error = %first, "restart after reset");
                    if let Err(reset) = engine.exec_part(env, &r.reset).await {
                        return Err(EngineError::Multiple(vec![first, reset]));
                    }
                    engine.exec_part(env, &r.doer).await
                }
                Self::Stock(s) => s.run(engine, env).await,
            }
        })
    }

    /// Bind `arg`. `Ok(None)` means this doer takes no argument.
    ///
    /// # Errors
    ///
    /// [`EngineError::ArgOverwrite`] for an already bound callable,
    /// [`EngineError::ArgNotApplied`] for a composite with no free
    /// placeholder, and resolution errors of lazy children.
    pub fn apply(&self, engine: &Engine, arg: Arg) -> Result<Option<Doer>> {
        match self {
            Self::Func(_) | Self::Sleep(_) | Self::Nothing(_) | Self::Fail(_) => Ok(None),
            Self::FuncArg(f) => {
                if f.arg.is_some() {
                    return Err(EngineError::ArgOverwrite {
                        action: f.name.clone(),
                    });
                }
                let mut bound = f.clone();
                bound.arg = Some(arg);
                Ok(Some(Self::FuncArg(bound)))
            }
            Self::Seq(seq) => Ok(seq.apply(engine, arg)?.map(Self::Seq)),
            Self::Parallel(seq) => Ok(seq.apply(engine, arg)?.map(Self::Parallel)),
            Self::RepeatN { n, doer } => Ok(doer.apply(engine, arg)?.map(|d| Self::repeat(*n, d))),
            Self::Lazy(name) => engine.resolve(name)?.apply(engine, arg),
            Self::IgnoreArg(doer) => Ok(Some(doer.as_ref().clone())),
            Self::Restart(r) => Ok(r.doer.apply(engine, arg)?.map(|d| {
                Self::Restart(Restart {
                    doer: Box::new(d),
                    check: r.check.clone(),
                    reset: r.reset.clone(),
                })
            })),
            Self::Stock(s) => s.apply(engine, arg).map(Some),
        }
    }
}

impl fmt::Display for Doer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Func(x) => f.write_str(&x.name),
            Self::FuncArg(x) => match x.arg {
                Some(arg) => write!(f, "{}:{arg}", x.name),
                None => write!(f, "{}:Arg?", x.name),
            },
            Self::Seq(seq) | Self::Parallel(seq) => f.write_str(&seq.name),
            Self::RepeatN { n, doer } => write!(f, "RepeatN(N={n} D={doer})"),
            Self::Sleep(d) => write!(f, "Sleep({d:?})"),
            Self::Nothing(name) | Self::Lazy(name) => f.write_str(name),
            Self::Fail(e) => write!(f, "{e}"),
            Self::IgnoreArg(doer) => write!(f, "{doer}"),
            Self::Restart(r) => write!(f, "{}", r.doer),
            Self::Stock(s) => write!(f, "{s}"),
        }
    }
}

impl fmt::Debug for Doer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Doer({self})")
    }
}
