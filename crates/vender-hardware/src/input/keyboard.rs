//! Front keyboard attached to the coprocessor TWI bus.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{HardwareError, Result};
use crate::mega::Client;

use super::event::{EVEND_KEYBOARD_TAG, InputEvent, KEY_DOT};
use super::source::Source;

const KEY_MASK_UP: u16 = 0x80;
/// The keyboard sends '.' as 'E'.
const KEY_DOT_RAW: u16 = b'E' as u16;

#[derive(Debug)]
pub struct EvendKeyboard {
    client: Option<Arc<Client>>,
    rx: mpsc::Receiver<u16>,
}

impl EvendKeyboard {
    /// Take the client's keyboard stream, dropping keys pressed before now.
    ///
    /// # Errors
    ///
    /// [`HardwareError::Configuration`] when the stream was already taken.
    pub fn new(client: Arc<Client>) -> Result<Self> {
        let rx = client
            .take_twi()
            .ok_or_else(|| HardwareError::configuration("mega keyboard stream already taken"))?;
        client.inc_ref(EVEND_KEYBOARD_TAG);
        let mut kb = Self {
            client: Some(client),
            rx,
        };
        let mut drained = 0;
        while kb.rx.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "keyboard stale keys");
        }
        Ok(kb)
    }

    /// Keyboard over a raw code stream.
    pub fn from_receiver(rx: mpsc::Receiver<u16>) -> Self {
        Self { client: None, rx }
    }

    /// Map a raw code to a key-down event; key-up codes yield `None`.
    pub fn translate(code: u16) -> Option<InputEvent> {
        if code & KEY_MASK_UP != 0 {
            return None;
        }
        let key = match code {
            KEY_DOT_RAW => KEY_DOT,
            k => k,
        };
        Some(InputEvent::keyboard(key))
    }
}

impl Source for EvendKeyboard {
    fn tag(&self) -> &'static str {
        EVEND_KEYBOARD_TAG
    }

    async fn read(&mut self) -> Result<InputEvent> {
        loop {
            let code = self
                .rx
                .recv()
                .await
                .ok_or_else(|| HardwareError::disconnected(EVEND_KEYBOARD_TAG))?;
            if let Some(ev) = Self::translate(code) {
                return Ok(ev);
            }
        }
    }
}

impl Drop for EvendKeyboard {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            client.dec_ref(EVEND_KEYBOARD_TAG);
        }
    }
}
