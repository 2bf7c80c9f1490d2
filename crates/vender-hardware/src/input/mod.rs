//! Keyboard, service button and synthetic input.

pub mod dispatcher;
pub mod event;
pub mod keyboard;
pub mod source;

pub use dispatcher::Dispatcher;
pub use event::InputEvent;
pub use keyboard::EvendKeyboard;
pub use source::{AnySource, DevInputEventSource, MockSource, MockSourceHandle, Source};
