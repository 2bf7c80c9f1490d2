use vender_hardware::input::InputEvent;

use crate::money::MoneyEvent;

/// What woke the UI loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Input(InputEvent),
    Money(MoneyEvent),
    /// Wait timed out.
    Time,
    /// Service button released.
    Service,
    /// A remote command asked for the lock.
    Lock,
    Stop,
}
