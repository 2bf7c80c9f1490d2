//! Input events and well-known keys.

use std::fmt;

pub const EVEND_KEYBOARD_TAG: &str = "evend-keyboard";
pub const DEV_INPUT_EVENT_TAG: &str = "dev-input-event";
pub const MONEY_TAG: &str = "money";

pub const KEY_ACCEPT: u16 = 13;
pub const KEY_REJECT: u16 = 27;
pub const KEY_CREAM_LESS: u16 = b'A' as u16;
pub const KEY_CREAM_MORE: u16 = b'B' as u16;
pub const KEY_SUGAR_LESS: u16 = b'C' as u16;
pub const KEY_SUGAR_MORE: u16 = b'D' as u16;
pub const KEY_DOT: u16 = b'.' as u16;
pub const KEY_MONEY_ABORT: u16 = 27;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputEvent {
    pub source: String,
    pub key: u16,
    pub up: bool,
}

impl InputEvent {
    pub fn new(source: impl Into<String>, key: u16, up: bool) -> Self {
        Self {
            source: source.into(),
            key,
            up,
        }
    }

    /// Key-down from the front keyboard.
    pub fn keyboard(key: u16) -> Self {
        Self::new(EVEND_KEYBOARD_TAG, key, false)
    }

    pub fn money_abort() -> Self {
        Self::new(MONEY_TAG, KEY_MONEY_ABORT, false)
    }

    fn from_keyboard(&self) -> bool {
        self.source == EVEND_KEYBOARD_TAG
    }

    pub fn is_accept(&self) -> bool {
        self.from_keyboard() && self.key == KEY_ACCEPT
    }

    pub fn is_reject(&self) -> bool {
        self.from_keyboard() && self.key == KEY_REJECT
    }

    pub fn is_dot(&self) -> bool {
        self.from_keyboard() && self.key == KEY_DOT
    }

    pub fn is_digit(&self) -> bool {
        self.from_keyboard() && (u16::from(b'0')..=u16::from(b'9')).contains(&self.key)
    }

    /// Digit or dot, the characters of a menu code.
    pub fn is_code_char(&self) -> bool {
        self.is_digit() || self.is_dot()
    }

    pub fn is_money_abort(&self) -> bool {
        self.source == MONEY_TAG && self.key == KEY_MONEY_ABORT
    }

    /// Service button release.
    pub fn is_service(&self) -> bool {
        self.source == DEV_INPUT_EVENT_TAG && self.up
    }

    /// Key as a character when it is printable ASCII.
    pub fn as_char(&self) -> Option<char> {
        u8::try_from(self.key)
            .ok()
            .filter(|b| b.is_ascii_graphic())
            .map(char::from)
    }
}

impl fmt::Display for InputEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.key)?;
        if self.up {
            f.write_str(":up")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(InputEvent::keyboard(KEY_ACCEPT).is_accept());
        assert!(!InputEvent::new(MONEY_TAG, KEY_ACCEPT, false).is_accept());
        assert!(InputEvent::money_abort().is_money_abort());
        assert!(!InputEvent::keyboard(KEY_REJECT).is_money_abort());
        assert!(InputEvent::keyboard(u16::from(b'7')).is_digit());
        assert!(InputEvent::keyboard(KEY_DOT).is_code_char());
        assert!(InputEvent::new(DEV_INPUT_EVENT_TAG, 256, true).is_service());
        assert!(!InputEvent::new(DEV_INPUT_EVENT_TAG, 256, false).is_service());
    }

    #[test]
    fn test_as_char() {
        assert_eq!(InputEvent::keyboard(KEY_CREAM_MORE).as_char(), Some('B'));
        assert_eq!(InputEvent::keyboard(KEY_ACCEPT).as_char(), None);
    }
}
