//! Stored inventory state.
//!
//! ```text
//! record: name_len u16 BE | name | enabled u8 | value f32 BE
//! ```

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct StockState {
    pub name: String,
    pub enabled: bool,
    pub value: f32,
}

pub fn encode(stocks: &[StockState]) -> Vec<u8> {
    let mut b = Vec::with_capacity(stocks.len() * 16);
    for s in stocks {
        let name = s.name.as_bytes();
        let len = u16::try_from(name.len()).unwrap_or(u16::MAX);
        b.extend_from_slice(&len.to_be_bytes());
        b.extend_from_slice(&name[..usize::from(len)]);
        b.push(u8::from(s.enabled));
        b.extend_from_slice(&s.value.to_be_bytes());
    }
    b
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(EngineError::State {
            message: format!("truncated record need={n} remaining={}", buf.len()),
        });
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

pub fn decode(mut buf: &[u8]) -> Result<Vec<StockState>> {
    let mut stocks = Vec::new();
    while !buf.is_empty() {
        let len = take(&mut buf, 2)?;
        let len = usize::from(u16::from_be_bytes([len[0], len[1]]));
        let name = String::from_utf8(take(&mut buf, len)?.to_vec()).map_err(|e| {
            EngineError::State {
                message: e.to_string(),
            }
        })?;
        let enabled = take(&mut buf, 1)?[0] != 0;
        let v = take(&mut buf, 4)?;
        stocks.push(StockState {
            name,
            enabled,
            value: f32::from_be_bytes([v[0], v[1], v[2], v[3]]),
        });
    }
    Ok(stocks)
}
