//! Line REPL shared by the `mdb` and `mega` commands.
//!
//! A line is a list of words run left to right:
//!
//! ```text
//! break            bus reset
//! s100             sleep 100 ms
//! @0b              transaction (MDB request or raw coprocessor command)
//! loop=5           repeat the rest of the line 5 times
//! par              run the rest of the line concurrently
//! log=yes|no       transaction debug logging
//! help | exit
//! ```

use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{LocalBoxFuture, join_all};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use vender_hardware::HardwareError;

pub const HELP: &str = "\
syntax: commands separated by whitespace
- break       bus reset
- sN          pause N milliseconds
- @XX...      transaction, hex bytes
- loop=N      repeat the rest of the line N times
- par         run the rest of the line concurrently
- log=yes|no  toggle transaction logging
- help, exit";

#[derive(Debug, Error)]
pub enum ReplError {
    #[error("parse word={word}: {message}")]
    Parse { word: String, message: String },

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

impl ReplError {
    fn parse(word: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            word: word.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Word {
    Break,
    Sleep(Duration),
    Tx(Vec<u8>),
    Loop(usize),
    Par,
    Log(bool),
    Help,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Device driven by the REPL.
pub trait Target {
    /// Run one transaction, return the answer for printing.
    fn tx(&self, data: &[u8]) -> impl Future<Output = Result<String>>;

    fn reset(&self) -> impl Future<Output = Result<()>>;

    fn set_log(&self, on: bool);
}

/// Split a line into words.
///
/// # Errors
///
/// [`ReplError::Parse`] naming the first word that is not understood.
pub fn parse_line(line: &str) -> Result<Vec<Word>> {
    line.split_whitespace().map(parse_word).collect()
}

fn parse_word(word: &str) -> Result<Word> {
    let w = match word {
        "break" => Word::Break,
        "par" => Word::Par,
        "help" | "?" => Word::Help,
        "exit" | "quit" => Word::Exit,
        "log=yes" => Word::Log(true),
        "log=no" => Word::Log(false),
        _ => {
            if let Some(hex) = word.strip_prefix('@') {
                let bytes = vender_core::hex::decode(hex)
                    .map_err(|e| ReplError::parse(word, e.to_string()))?;
                if bytes.is_empty() {
                    return Err(ReplError::parse(word, "empty transaction"));
                }
                Word::Tx(bytes)
            } else if let Some(n) = word.strip_prefix("loop=") {
                let n = n
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ReplError::parse(word, e.to_string()))?;
                Word::Loop(n)
            } else if let Some(ms) = word.strip_prefix('s') {
                let ms = ms
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ReplError::parse(word, e.to_string()))?;
                Word::Sleep(Duration::from_millis(ms))
            } else {
                return Err(ReplError::parse(word, "unknown command, try help"));
            }
        }
    };
    Ok(w)
}

async fn run_one<T: Target>(target: &T, word: &Word) -> Result<Flow> {
    match word {
        Word::Break => target.reset().await?,
        Word::Sleep(d) => tokio::time::sleep(*d).await,
        Word::Tx(data) => {
            let answer = target.tx(data).await?;
            println!("< {answer}");
        }
        Word::Log(on) => target.set_log(*on),
        Word::Help => println!("{HELP}"),
        Word::Exit => return Ok(Flow::Exit),
        Word::Loop(_) | Word::Par => {}
    }
    Ok(Flow::Continue)
}

/// Run `words` in order. `loop=N` and `par` apply to the rest of the line.
pub fn run_words<'a, T: Target>(target: &'a T, words: &'a [Word]) -> LocalBoxFuture<'a, Result<Flow>> {
    async move {
        for (i, word) in words.iter().enumerate() {
            let rest = &words[i + 1..];
            match word {
                Word::Loop(n) => {
                    for round in 0..*n {
                        debug!(round, "repl loop");
                        if run_words(target, rest).await? == Flow::Exit {
                            return Ok(Flow::Exit);
                        }
                    }
                    return Ok(Flow::Continue);
                }
                Word::Par => {
                    let results = join_all(rest.iter().map(|w| run_one(target, w))).await;
                    let mut flow = Flow::Continue;
                    for r in results {
                        if r? == Flow::Exit {
                            flow = Flow::Exit;
                        }
                    }
                    return Ok(flow);
                }
                _ => {
                    if run_one(target, word).await? == Flow::Exit {
                        return Ok(Flow::Exit);
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }
    .boxed_local()
}

/// Read lines from `input` until `exit`, end of input or `alive` is
/// cancelled. Errors are logged and the next line is read.
///
/// # Errors
///
/// Only read errors of `input`.
pub async fn run<T, R>(target: &T, input: R, alive: &CancellationToken) -> std::io::Result<()>
where
    T: Target,
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            () = alive.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let words = match parse_line(&line) {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "repl");
                continue;
            }
        };
        match run_words(target, &words).await {
            Ok(Flow::Exit) => break,
            Ok(Flow::Continue) => {}
            Err(e) => error!(line = %line, error = %e, "repl"),
        }
    }
    Ok(())
}
