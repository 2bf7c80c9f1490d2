//! Character display: device seam, encoding and the text engine.

pub mod cp1251;
pub mod device;
pub mod text;

pub use device::{DisplayDevice, DisplayOp, LogDisplay, MockDisplay, MockDisplayHandle};
pub use text::{Codepage, MAX_WIDTH, State, TextDisplay, TextDisplayConfig};
