//! Common MDB peripheral plumbing: state tracking, RESET policy and poll
//! pacing.
//!
//! ```text
//!  Invalid ──init──► Inited ──RESET ok──► Online ──setup done──► Ready
//!                       ▲                   │  ▲                   │
//!                       │         timeout   ▼  │ response          │
//!                       └──── RESET ◄──── Offline ◄────────────────┘
//!                                          Error (other failures)
//! ```
//!
//! Every command goes through [`Device::tx`] under the device command lock,
//! with a [`TxOpt`] saying how the current state and the outcome are
//! handled.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{HardwareError, Result};

use super::bus::Bus;
use super::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceState {
    /// New, not usable.
    Invalid = 0,
    /// Configured, not probed yet.
    Inited = 1,
    /// Answered RESET, may still need setup.
    Online = 2,
    /// Setup done, ready for useful work.
    Ready = 3,
    /// Responds but misbehaves.
    Error = 4,
    /// Does not respond.
    Offline = 5,
}

impl DeviceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Inited,
            2 => Self::Online,
            3 => Self::Ready,
            4 => Self::Error,
            5 => Self::Offline,
            _ => Self::Invalid,
        }
    }

    pub fn ok(self) -> bool {
        matches!(self, Self::Online | Self::Ready)
    }

    pub fn online(self) -> bool {
        matches!(self, Self::Online | Self::Ready | Self::Error)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-command state policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOpt {
    /// Timeout marks the device offline.
    pub timeout_offline: bool,
    /// Refuse to send unless the device is online or ready.
    pub require_ok: bool,
    /// Never RESET before this command.
    pub no_reset: bool,
    /// RESET first when in the error state.
    pub reset_error: bool,
    /// RESET first when offline.
    pub reset_offline: bool,
}

impl TxOpt {
    /// Command known to be supported; timeout means the device is gone.
    pub const KNOWN: TxOpt = TxOpt {
        timeout_offline: true,
        require_ok: false,
        no_reset: false,
        reset_error: true,
        reset_offline: true,
    };
    /// Device may ignore the command.
    pub const MAYBE: TxOpt = TxOpt {
        timeout_offline: false,
        require_ok: true,
        no_reset: false,
        reset_error: false,
        reset_offline: true,
    };
    pub const RESET: TxOpt = TxOpt {
        timeout_offline: true,
        require_ok: false,
        no_reset: true,
        reset_error: false,
        reset_offline: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delays {
    pub after_reset: Duration,
    pub idle: Duration,
    pub next: Duration,
    pub offline: Duration,
    pub idle_threshold: Duration,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            after_reset: Duration::from_millis(500),
            idle: Duration::from_millis(700),
            next: Duration::from_millis(200),
            offline: Duration::from_secs(10),
            idle_threshold: Duration::from_secs(30),
        }
    }
}

impl Delays {
    /// Near-zero pacing for scripted buses.
    pub const FAST: Delays = Delays {
        after_reset: Duration::from_millis(1),
        idle: Duration::from_millis(1),
        next: Duration::from_millis(1),
        offline: Duration::from_millis(1),
        idle_threshold: Duration::from_millis(1),
    };
}

#[derive(Debug, Default)]
struct Clock {
    last_ok: Option<Instant>,
    last_off: Option<Instant>,
    last_reset: Option<Instant>,
}

#[derive(Debug)]
pub struct Device {
    name: String,
    address: u8,
    bus: Arc<Bus>,
    state: AtomicU8,
    clock: Mutex<Clock>,
    cmd: tokio::sync::Mutex<()>,
    delays: Delays,
    packet_reset: Packet,
    packet_setup: Packet,
    packet_poll: Packet,
    setup_response: Mutex<Packet>,
}

/// Command lock held across a sequence of transactions.
pub struct DeviceLock<'a> {
    device: &'a Device,
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

impl Device {
    pub fn new(bus: Arc<Bus>, address: u8, name: impl Into<String>, delays: Delays) -> Self {
        let single = |offset: u8| Packet::from_bytes(&[address.wrapping_add(offset)]).unwrap_or_default();
        Self {
            name: name.into(),
            address,
            bus,
            state: AtomicU8::new(DeviceState::Inited as u8),
            clock: Mutex::new(Clock {
                last_off: Some(Instant::now()),
                ..Clock::default()
            }),
            cmd: tokio::sync::Mutex::new(()),
            delays,
            packet_reset: single(0),
            packet_setup: single(1),
            packet_poll: single(3),
            setup_response: Mutex::new(Packet::EMPTY),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn delays(&self) -> &Delays {
        &self.delays
    }

    pub fn packet_poll(&self) -> &Packet {
        &self.packet_poll
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: DeviceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn set_ready(&self) {
        self.set_state(DeviceState::Ready);
    }

    pub fn set_online(&self) {
        self.set_state(DeviceState::Online);
    }

    pub fn set_error(&self, e: &HardwareError) {
        info!(device = %self.name, error = %e, "mdb device error");
        self.set_state(DeviceState::Error);
    }

    pub fn validate_online(&self) -> Result<()> {
        let st = self.state();
        if st.online() {
            return Ok(());
        }
        Err(HardwareError::StateInvalid {
            device: self.name.clone(),
            state: st.to_string(),
        })
    }

    /// Time since the last successful response, `None` before the first.
    pub fn since_ok(&self) -> Option<Duration> {
        self.clock().last_ok.map(|t| t.elapsed())
    }

    pub fn setup_response(&self) -> Packet {
        self.setup_response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clock(&self) -> MutexGuard<'_, Clock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn lock(&self) -> DeviceLock<'_> {
        DeviceLock {
            device: self,
            _guard: self.cmd.lock().await,
        }
    }

    pub async fn tx_known(&self, request: &Packet) -> Result<Packet> {
        self.lock().await.tx(request, TxOpt::KNOWN).await
    }

    pub async fn tx_maybe(&self, request: &Packet) -> Result<Packet> {
        self.lock().await.tx(request, TxOpt::MAYBE).await
    }

    pub async fn tx_custom(&self, request: &Packet, opt: TxOpt) -> Result<Packet> {
        self.lock().await.tx(request, opt).await
    }

    /// SETUP, stored for later inspection.
    ///
    /// # Errors
    ///
    /// Transport errors, or [`HardwareError::Device`] when the response is
    /// shorter than `min_len`.
    pub async fn tx_setup(&self, min_len: usize) -> Result<Packet> {
        let response = self.tx_known(&self.packet_setup).await?;
        if response.len() < min_len {
            return Err(HardwareError::device(
                &self.name,
                format!("SETUP response={response} expected>={min_len}"),
            ));
        }
        *self
            .setup_response
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = response.clone();
        Ok(response)
    }

    pub async fn reset(&self) -> Result<()> {
        self.lock().await.reset().await
    }

    /// Poll with [`TxOpt::KNOWN`] whenever no command succeeded for
    /// `interval`, until `stop`.
    pub async fn keepalive(&self, interval: Duration, stop: CancellationToken) {
        let mut wait = interval;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(wait.max(Duration::from_millis(1))) => {}
            }
            let lock = self.lock().await;
            let age = self.since_ok().unwrap_or(interval);
            wait = interval.saturating_sub(age);
            if wait.is_zero() {
                if let Err(e) = lock.tx(&self.packet_poll, TxOpt::KNOWN).await {
                    if !e.is_offline() {
                        info!(device = %self.name, error = %e, "keepalive ignoring error");
                    }
                }
                wait = interval;
            }
        }
    }
}

impl DeviceLock<'_> {
    pub async fn tx(&self, request: &Packet, opt: TxOpt) -> Result<Packet> {
        let d = self.device;
        let st = d.state();
        let mut pre = Ok(());
        match st {
            DeviceState::Invalid => {
                return Err(HardwareError::StateInvalid {
                    device: d.name.clone(),
                    state: st.to_string(),
                });
            }
            DeviceState::Inited if !opt.no_reset => pre = self.reset().await,
            DeviceState::Error if opt.reset_error && !opt.no_reset => pre = self.reset().await,
            DeviceState::Offline => {
                debug!(device = %d.name, request = %request, "tx while offline");
                if opt.reset_offline && !opt.no_reset {
                    pre = self.reset().await;
                }
            }
            _ => {}
        }
        if pre.is_ok() && opt.require_ok && !d.state().ok() {
            pre = Err(HardwareError::StateInvalid {
                device: d.name.clone(),
                state: d.state().to_string(),
            });
        }
        match pre {
            Ok(()) => self.exchange(st, request, opt).await,
            Err(e) => {
                d.set_error(&e);
                Err(e)
            }
        }
    }

    /// Bus round trip and the state change it implies.
    async fn exchange(&self, st: DeviceState, request: &Packet, opt: TxOpt) -> Result<Packet> {
        let d = self.device;
        let result = match d.bus.tx(request).await {
            Ok(response) => {
                let mut clock = d.clock();
                clock.last_ok = Some(Instant::now());
                clock.last_off = None;
                drop(clock);
                if st != DeviceState::Ready {
                    d.set_online();
                }
                Ok(response)
            }
            Err(e) if e.is_timeout() && opt.timeout_offline => {
                d.clock().last_off.get_or_insert_with(Instant::now);
                d.set_state(DeviceState::Offline);
                Err(HardwareError::offline(&d.name))
            }
            Err(e) if e.is_timeout() => Err(e),
            Err(e) => {
                d.set_error(&e);
                Err(e)
            }
        };
        debug!(
            device = %d.name,
            request = %request,
            ok = result.is_ok(),
            from = %st,
            to = %d.state(),
            "mdb device tx"
        );
        result
    }

    /// Send `request` until `f` says stop, `f` fails or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Transport errors, errors from `f`, or a timeout which also puts the
    /// device into the error state.
    pub async fn poll_loop<F>(
        &self,
        tag: &str,
        request: &Packet,
        timeout: Duration,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(&Packet) -> Result<bool>,
    {
        let d = self.device;
        let begin = Instant::now();
        loop {
            let response = self.tx(request, TxOpt::KNOWN).await?;
            if f(&response)? {
                return Ok(());
            }
            tokio::time::sleep(d.delays.next).await;
            if begin.elapsed() > timeout {
                let e = HardwareError::timeout(format!("{tag} poll loop"));
                d.set_error(&e);
                return Err(e);
            }
        }
    }

    /// RESET, not more often than the offline delay.
    pub async fn reset(&self) -> Result<()> {
        let d = self.device;
        let since_reset = d.clock().last_reset.map(|t| t.elapsed());
        if let Some(age) = since_reset
            && age < d.delays.offline
        {
            debug!(device = %d.name, delay = ?(d.delays.offline - age), "reset delayed");
            tokio::time::sleep(d.delays.offline - age).await;
        }
        d.clock().last_off.get_or_insert_with(Instant::now);
        let result = self
            .exchange(d.state(), &d.packet_reset, TxOpt::RESET)
            .await;
        d.clock().last_reset = Some(Instant::now());
        result.map_err(|e| HardwareError::device(&d.name, format!("RESET: {e}")))?;
        tokio::time::sleep(d.delays.after_reset).await;
        Ok(())
    }
}

/// Switches poll pacing between the fast and idle delays.
#[derive(Debug, Default)]
pub struct PollDelay {
    last_active: Option<Instant>,
    last_delay: Duration,
}

impl PollDelay {
    /// Sleep before the next poll. Returns false when `stop` fired.
    pub async fn delay(
        &mut self,
        delays: &Delays,
        active: bool,
        error: bool,
        stop: &CancellationToken,
    ) -> bool {
        let mut delay = delays.next;
        if error {
            delay = delays.idle;
        } else if active {
            self.last_active = Some(Instant::now());
        } else if self.last_delay != delays.idle {
            let idle_for = self.last_active.map(|t| t.elapsed());
            if idle_for.is_none_or(|d| d > delays.idle_threshold) {
                delay = delays.idle;
            }
        }
        self.last_delay = delay;
        tokio::select! {
            _ = stop.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
