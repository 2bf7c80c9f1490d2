//! Engine errors.
//!
//! Errors are `Clone` so a failed resolution can be stored inside a
//! [`Doer::Fail`](crate::Doer::Fail) and returned from every later call.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("action={name} not resolved")]
    NotResolved { name: String },

    #[error("action={name} already registered")]
    AlreadyRegistered { name: String },

    /// An argument was offered but nothing took it.
    #[error("{action}: argument is not applied")]
    ArgNotApplied { action: String },

    /// The doer needs an argument and was never given one.
    #[error("{action}: argument missing")]
    ArgMissing { action: String },

    #[error("{action}: argument already applied")]
    ArgOverwrite { action: String },

    #[error("stock={stock} is too low")]
    StockLow { stock: String },

    #[error("stock name={name} code={code} not found")]
    UnknownStock { name: String, code: u32 },

    #[error("scenario={tag} parse: {message}")]
    Parse { tag: String, message: String },

    #[error("config: {message}")]
    Config { message: String },

    #[error("inventory state: {message}")]
    State { message: String },

    /// Lower layer failure of a registered action.
    #[error("{action}: {source}")]
    Action {
        action: String,
        #[source]
        source: Arc<dyn StdError + Send + Sync>,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("{}", MultipleDisplay(.0))]
    Multiple(Vec<EngineError>),
}

struct MultipleDisplay<'a>(&'a [EngineError]);

impl fmt::Display for MultipleDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl EngineError {
    pub fn not_resolved(name: impl Into<String>) -> Self {
        Self::NotResolved { name: name.into() }
    }

    pub fn parse(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            tag: tag.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Wrap any error raised by the code behind an action.
    pub fn action<E>(action: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Action {
            action: action.into(),
            source: Arc::new(source),
        }
    }

    pub fn annotate(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error under any annotation.
    pub fn root(&self) -> &EngineError {
        match self {
            Self::Context { source, .. } => source.root(),
            _ => self,
        }
    }

    pub fn is_not_resolved(&self) -> bool {
        match self.root() {
            Self::NotResolved { .. } => true,
            Self::Multiple(errs) => errs.iter().any(Self::is_not_resolved),
            _ => false,
        }
    }

    pub fn is_stock_low(&self) -> bool {
        match self.root() {
            Self::StockLow { .. } => true,
            Self::Multiple(errs) => errs.iter().any(Self::is_stock_low),
            _ => false,
        }
    }

    /// One error as itself, several as [`EngineError::Multiple`].
    pub fn fold(mut errs: Vec<EngineError>) -> Result<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(Self::Multiple(errs)),
        }
    }
}
