//! Two line text display with scrolling.
//!
//! ```text
//!   set_lines / message ──► State{l1,l2} ──► flush ──► DisplayDevice
//!                                 ▲            │
//!          scroll task ── tick ───┘            └──► update channel (cap 1)
//! ```
//!
//! Lines longer than the width scroll by one position per tick, with a
//! `width/2` gap between the end and the wrapped start.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{HardwareError, Result};

use super::cp1251;
use super::device::DisplayDevice;

pub const MAX_WIDTH: usize = vender_core::DISPLAY_MAX_WIDTH;

const SPACES: [u8; MAX_WIDTH] = [b' '; MAX_WIDTH];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codepage {
    Utf8,
    Windows1251,
}

impl Codepage {
    /// # Errors
    ///
    /// [`HardwareError::Configuration`] for an unknown name.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "" | "utf-8" | "utf8" => Ok(Self::Utf8),
            "windows-1251" | "cp1251" => Ok(Self::Windows1251),
            other => Err(HardwareError::configuration(format!(
                "display codepage={other} not supported"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextDisplayConfig {
    pub width: usize,
    pub codepage: Codepage,
    pub scroll_delay: Duration,
}

impl Default for TextDisplayConfig {
    fn default() -> Self {
        Self {
            width: 16,
            codepage: Codepage::Windows1251,
            scroll_delay: Duration::from_millis(200),
        }
    }
}

/// Display contents as device bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    pub l1: Vec<u8>,
    pub l2: Vec<u8>,
}

impl State {
    pub fn clear(&mut self) {
        self.l1.clear();
        self.l2.clear();
    }

    /// Both lines padded to `width`.
    pub fn format(&self, width: usize) -> String {
        format!(
            "{}\n{}",
            cp1251::decode(&pad_space(&self.l1, width)),
            cp1251::decode(&pad_space(&self.l2, width))
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", cp1251::decode(&self.l1), cp1251::decode(&self.l2))
    }
}

struct Inner {
    dev: Box<dyn DisplayDevice>,
    state: State,
    upd: Option<mpsc::Sender<State>>,
    last: (Option<String>, Option<String>),
}

pub struct TextDisplay {
    inner: Mutex<Inner>,
    width: usize,
    codepage: Codepage,
    scroll_delay: Duration,
    tick: AtomicU32,
    alive: CancellationToken,
}

impl TextDisplay {
    /// # Errors
    ///
    /// [`HardwareError::Configuration`] when width is 0 or above [`MAX_WIDTH`].
    pub fn new(dev: Box<dyn DisplayDevice>, config: &TextDisplayConfig) -> Result<Self> {
        if config.width == 0 || config.width > MAX_WIDTH {
            return Err(HardwareError::configuration(format!(
                "display width={} must be 1..={MAX_WIDTH}",
                config.width
            )));
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                dev,
                state: State::default(),
                upd: None,
                last: (None, None),
            }),
            width: config.width,
            codepage: config.codepage,
            scroll_delay: config.scroll_delay,
            tick: AtomicU32::new(0),
            alive: CancellationToken::new(),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn state(&self) -> State {
        self.lock().state.clone()
    }

    pub fn set_update_chan(&self, tx: Option<mpsc::Sender<State>>) {
        self.lock().upd = tx;
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.state.clear();
        inner.dev.clear();
        self.flush(&mut inner);
    }

    /// `None` keeps the line, an empty slice blanks it.
    pub fn set_lines_bytes(&self, b1: Option<&[u8]>, b2: Option<&[u8]>) {
        let mut inner = self.lock();
        self.store_lines(&mut inner, b1, b2);
    }

    pub fn set_lines(&self, l1: Option<&str>, l2: Option<&str>) {
        let b1 = l1.map(|s| self.translate(s));
        let b2 = l2.map(|s| self.translate(s));

        let mut inner = self.lock();
        if let Some(s) = l1
            && inner.last.0.as_deref() != Some(s)
        {
            info!(line = 1, text = s, "display");
            inner.last.0 = Some(s.to_string());
        }
        if let Some(s) = l2
            && inner.last.1.as_deref() != Some(s)
        {
            info!(line = 2, text = s, "display");
            inner.last.1 = Some(s.to_string());
        }
        self.store_lines(&mut inner, b1.as_deref(), b2.as_deref());
    }

    fn store_lines(&self, inner: &mut Inner, b1: Option<&[u8]>, b2: Option<&[u8]>) {
        if let Some(b) = b1 {
            inner.state.l1 = b.to_vec();
        }
        if let Some(b) = b2 {
            inner.state.l2 = b.to_vec();
        }
        self.tick.store(0, Ordering::Relaxed);
        self.flush(inner);
    }

    /// Show a temporary message until `wait` completes, then restore.
    pub async fn message<F>(&self, l1: &str, l2: &str, wait: F)
    where
        F: Future<Output = ()>,
    {
        let next = State {
            l1: self.translate(l1),
            l2: self.translate(l2),
        };
        let prev = {
            let mut inner = self.lock();
            let prev = std::mem::replace(&mut inner.state, next);
            self.flush(&mut inner);
            prev
        };
        wait.await;
        let mut inner = self.lock();
        inner.state = prev;
        self.flush(&mut inner);
    }

    pub fn tick(&self) {
        let mut inner = self.lock();
        self.tick.fetch_add(1, Ordering::Relaxed);
        self.flush(&mut inner);
    }

    /// Scroll loop. Returns at once when the delay is zero.
    pub async fn run(&self) {
        if self.scroll_delay.is_zero() {
            return;
        }
        let mut interval = tokio::time::interval(self.scroll_delay);
        interval.tick().await;
        loop {
            tokio::select! {
                () = self.alive.cancelled() => return,
                _ = interval.tick() => self.tick(),
            }
        }
    }

    pub fn close(&self) {
        self.alive.cancel();
    }

    /// Encode for the device. Empty input stays empty; a trailing NUL is
    /// stripped and disables padding.
    pub fn translate(&self, s: &str) -> Vec<u8> {
        if s.is_empty() {
            return Vec::new();
        }
        let (text, pad) = match s.strip_suffix('\0') {
            Some(t) => (t, false),
            None => (s, true),
        };
        let b = match self.codepage {
            Codepage::Utf8 => text.as_bytes().to_vec(),
            Codepage::Windows1251 => cp1251::encode(text),
        };
        if pad { self.pad_right(&b) } else { b }
    }

    pub fn pad_right(&self, b: &[u8]) -> Vec<u8> {
        pad_space(b, self.width)
    }

    pub fn just_center(&self, b: &[u8]) -> Vec<u8> {
        let (l, w) = (b.len(), self.width);
        if l == 0 {
            return SPACES[..w].to_vec();
        }
        if l >= w - 1 {
            return b.to_vec();
        }
        let left = (w - l) / 2;
        let mut out = Vec::with_capacity(w);
        out.extend_from_slice(&SPACES[..left]);
        out.extend_from_slice(b);
        out.extend_from_slice(&SPACES[..w - l - left]);
        out
    }

    fn flush(&self, inner: &mut Inner) {
        let tick = self.tick.load(Ordering::Relaxed);
        let mut buf = [0u8; MAX_WIDTH];
        let buf = &mut buf[..self.width];
        for (y, content) in [(1u8, inner.state.l1.clone()), (2, inner.state.l2.clone())] {
            let n = scroll_wrap(buf, &content, tick);
            if n < self.width {
                inner.dev.cursor_yx(y, 1);
                inner.dev.write(&SPACES[..self.width]);
            }
            if !content.is_empty() {
                inner.dev.cursor_yx(y, 1);
                inner.dev.write(&buf[..n]);
            }
        }
        if let Some(tx) = &inner.upd {
            let _ = tx.try_send(inner.state.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TextDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextDisplay")
            .field("width", &self.width)
            .field("codepage", &self.codepage)
            .field("scroll_delay", &self.scroll_delay)
            .finish_non_exhaustive()
    }
}

pub fn pad_space(b: &[u8], width: usize) -> Vec<u8> {
    let mut out = b.to_vec();
    if out.len() < width {
        out.resize(width, b' ');
    }
    out
}

fn copy_into(dst: &mut [u8], src: &[u8]) -> usize {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
    n
}

/// Render `content` into `buf` (one display line) at scroll position
/// `tick`. Returns the number of meaningful bytes.
pub fn scroll_wrap(buf: &mut [u8], content: &[u8], tick: u32) -> usize {
    let width = buf.len();
    let length = content.len();
    if length <= width {
        buf[..length].copy_from_slice(content);
        buf[length..].fill(b' ');
        return length;
    }
    let mut gap = width / 2;
    let offset = tick as usize % (length + gap);
    let mut n = 0;
    if offset < length {
        n = copy_into(buf, &content[offset..]);
    } else {
        gap -= offset - length;
    }
    let k = gap.min(width - n);
    buf[n..n + k].fill(b' ');
    n += k;
    n += copy_into(&mut buf[n..], content);
    n
}
