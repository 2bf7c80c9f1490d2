//! Character LCD seam.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::cp1251;

/// Two line character display. Positions are 1-based.
pub trait DisplayDevice: Send {
    fn clear(&mut self);
    fn cursor_yx(&mut self, y: u8, x: u8) -> bool;
    fn write(&mut self, b: &[u8]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayOp {
    Clear,
    Cursor(u8, u8),
    Write(Vec<u8>),
}

#[derive(Debug, Default)]
struct Screen {
    ops: Vec<DisplayOp>,
    lines: [Vec<u8>; 2],
    y: usize,
    x: usize,
}

/// Records operations and keeps an emulated screen.
#[derive(Debug)]
pub struct MockDisplay {
    width: usize,
    screen: Arc<Mutex<Screen>>,
}

#[derive(Debug, Clone)]
pub struct MockDisplayHandle {
    screen: Arc<Mutex<Screen>>,
}

impl MockDisplay {
    pub fn new(width: usize) -> (Self, MockDisplayHandle) {
        let screen = Arc::new(Mutex::new(Screen {
            lines: [vec![b' '; width], vec![b' '; width]],
            ..Screen::default()
        }));
        (
            Self {
                width,
                screen: screen.clone(),
            },
            MockDisplayHandle { screen },
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Screen> {
        self.screen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DisplayDevice for MockDisplay {
    fn clear(&mut self) {
        let width = self.width;
        let mut s = self.lock();
        s.ops.push(DisplayOp::Clear);
        s.lines = [vec![b' '; width], vec![b' '; width]];
        s.y = 0;
        s.x = 0;
    }

    fn cursor_yx(&mut self, y: u8, x: u8) -> bool {
        let mut s = self.lock();
        s.ops.push(DisplayOp::Cursor(y, x));
        if !(1..=2).contains(&y) || x == 0 || usize::from(x) > self.width {
            return false;
        }
        s.y = usize::from(y - 1);
        s.x = usize::from(x - 1);
        true
    }

    fn write(&mut self, b: &[u8]) {
        let mut s = self.lock();
        s.ops.push(DisplayOp::Write(b.to_vec()));
        let (y, x) = (s.y, s.x);
        let line = &mut s.lines[y];
        let n = b.len().min(line.len().saturating_sub(x));
        line[x..x + n].copy_from_slice(&b[..n]);
        s.x += n;
    }
}

impl MockDisplayHandle {
    pub fn ops(&self) -> Vec<DisplayOp> {
        self.lock().ops.clone()
    }

    pub fn take_ops(&self) -> Vec<DisplayOp> {
        std::mem::take(&mut self.lock().ops)
    }

    /// Emulated screen contents, decoded.
    pub fn screen(&self) -> [String; 2] {
        let s = self.lock();
        [cp1251::decode(&s.lines[0]), cp1251::decode(&s.lines[1])]
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Screen> {
        self.screen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Headless device: every write goes to the debug log.
#[derive(Debug, Default)]
pub struct LogDisplay {
    y: u8,
}

impl DisplayDevice for LogDisplay {
    fn clear(&mut self) {
        debug!("display clear");
    }

    fn cursor_yx(&mut self, y: u8, _x: u8) -> bool {
        self.y = y;
        true
    }

    fn write(&mut self, b: &[u8]) {
        debug!(line = self.y, text = %cp1251::decode(b), "display write");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_screen() {
        let (mut d, h) = MockDisplay::new(4);
        assert!(d.cursor_yx(2, 2));
        d.write(b"abcdef");
        assert!(!d.cursor_yx(3, 1));
        assert_eq!(h.screen(), ["    ".to_string(), " abc".to_string()]);
        d.clear();
        assert_eq!(h.screen()[1], "    ");
        assert_eq!(h.take_ops().len(), 4);
        assert!(h.ops().is_empty());
    }
}
