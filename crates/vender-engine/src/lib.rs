//! Scenario engine and ingredient inventory.
//!
//! ```text
//!   config text          registry                 execution
//!  "cup add.sugar(4)" -> Engine::parse_text -> Doer graph -> Engine::exec
//!                          |   ^                    |
//!                          v   | resolve name(N)    v validate, run
//!                      actions: HashMap<String, Doer>
//!                          ^
//!                          | add.NAME(?) stock.NAME.spend(?)
//!                      Inventory (stocks with atomic values)
//! ```
//!
//! ```
//! # async fn demo() -> vender_engine::Result<()> {
//! use vender_engine::{Doer, Engine, ExecEnv};
//!
//! let engine = Engine::new();
//! engine.register("cup", Doer::func("cup", |_| async { Ok(()) }))?;
//! let d = engine.parse_text("menu:1", "cup sleep(10ms)")?;
//! engine.exec(&ExecEnv::new(), &d).await?;
//! # Ok(())
//! # }
//! ```

pub mod doer;
pub mod engine;
pub mod error;
pub mod inventory;

pub use doer::{Arg, Doer, ExecEnv};
pub use engine::{Engine, ProfileFn};
pub use error::{EngineError, Result};
pub use inventory::{Inventory, Stock};
