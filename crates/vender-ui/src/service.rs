use std::net::UdpSocket;
use std::ops::ControlFlow;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use vender_core::Amount;
use vender_engine::ExecEnv;
use vender_hardware::input::InputEvent;
use vender_hardware::input::event::{KEY_CREAM_LESS, KEY_CREAM_MORE};
use vender_protocol::tele::State;

use crate::auth;
use crate::event::Event;
use crate::money::MoneyEvent;
use crate::state::UiState;
use crate::ui::{CreditAccept, Ui};

const MSG_ERROR: &str = "error";
const MSG_MENU: &str = "Menu";
const AUTH_PREFIX: [u8; 2] = [0x8d, b' '];
const AUTH_MAX_LEN: usize = 16;

/// Service menu entries and the state each one opens.
pub const SERVICE_MENU: [(&str, UiState); 6] = [
    ("inventory", UiState::ServiceInventory),
    ("test", UiState::ServiceTest),
    ("reboot", UiState::ServiceReboot),
    ("network", UiState::ServiceNetwork),
    ("money-load", UiState::ServiceMoneyLoad),
    ("report", UiState::ServiceReport),
];

fn add_wrap(current: usize, len: usize, forward: bool) -> usize {
    if len == 0 {
        return 0;
    }
    if forward {
        (current + 1) % len
    } else {
        (current + len - 1) % len
    }
}

impl Ui {
    /// Wait for service input. `Continue(None)` for money events, `Break`
    /// for events that end the service session.
    async fn service_wait_input(&mut self) -> ControlFlow<UiState, Option<InputEvent>> {
        loop {
            match self.wait(self.service.reset).await {
                Event::Input(e) => return ControlFlow::Continue(Some(e)),
                Event::Money(e) => {
                    debug!(event = ?e, "service money event");
                    return ControlFlow::Continue(None);
                }
                Event::Time => {
                    debug!("service reset timeout");
                    return ControlFlow::Break(UiState::ServiceEnd);
                }
                Event::Service | Event::Stop => return ControlFlow::Break(UiState::ServiceEnd),
                // service is never interrupted by a remote lock
                Event::Lock => {}
            }
        }
    }

    /// Show an error and wait for any key before moving on.
    async fn service_error(&mut self, message: &str) {
        self.display.set_lines(Some(MSG_ERROR), Some(message));
        let _ = self.service_wait_input().await;
    }

    pub(crate) async fn on_service_begin(&mut self) -> UiState {
        let g = Arc::clone(&self.g);
        self.input_buf.clear();
        self.service.ask_report = false;
        self.service.menu_idx = 0;
        self.service.inv_idx = 0;
        self.service.test_idx = 0;

        let mut names = Vec::new();
        g.inventory.iter(|s| names.push(s.name().to_string()));
        let mut stocks: Vec<_> = names
            .iter()
            .filter_map(|name| g.inventory.get(name))
            .collect();
        stocks.sort_by(|a, b| a.code().cmp(&b.code()).then_with(|| a.name().cmp(b.name())));
        for s in &stocks {
            debug!(stock = s.name(), code = s.code(), value = s.value(), "service inventory");
        }
        self.service.inv_list = stocks;

        if self
            .exec_hooks("on_service_begin", &g.config.engine.on_service_begin)
            .await
            .is_err()
        {
            return UiState::Broken;
        }
        info!("service begin");
        g.tele.state(State::Service);
        UiState::ServiceAuth
    }

    pub(crate) async fn on_service_auth(&mut self) -> UiState {
        let g = Arc::clone(&self.g);
        let config = &g.config.ui.service;
        if !config.auth.enable {
            return UiState::ServiceMenu;
        }
        let hash = auth::visual_hash(&self.input_buf, &self.service.salt);
        let mut l2 = AUTH_PREFIX.to_vec();
        l2.extend_from_slice(hash.as_bytes());
        self.display
            .set_lines_bytes(Some(&self.display.translate(&config.msg_auth)), Some(&l2));

        let e = match self.service_wait_input().await {
            ControlFlow::Break(next) => return next,
            ControlFlow::Continue(None) => return UiState::ServiceEnd,
            ControlFlow::Continue(Some(e)) => e,
        };
        if e.is_digit() {
            self.input_buf.push(e.key as u8);
            if self.input_buf.len() > AUTH_MAX_LEN {
                self.service_error("len").await;
                return UiState::ServiceEnd;
            }
            return UiState::ServiceAuth;
        }
        if e.is_accept() {
            if self.input_buf.is_empty() {
                self.service_error("empty").await;
                return UiState::ServiceEnd;
            }
            if auth::check(&self.input_buf, &self.service.salt, &config.auth.passwords) {
                info!("service auth ok");
                self.input_buf.clear();
                return UiState::ServiceMenu;
            }
            warn!("service auth denied");
            self.service_error("sorry").await;
            return UiState::ServiceEnd;
        }
        UiState::ServiceEnd
    }

    pub(crate) async fn on_service_menu(&mut self) -> UiState {
        let (name, _) = SERVICE_MENU[self.service.menu_idx];
        self.display.set_lines(
            Some(MSG_MENU),
            Some(&format!("{} {name}", self.service.menu_idx + 1)),
        );

        let e = match self.service_wait_input().await {
            ControlFlow::Break(next) => return next,
            ControlFlow::Continue(None) => return UiState::ServiceMenu,
            ControlFlow::Continue(Some(e)) => e,
        };
        let len = SERVICE_MENU.len();
        match e.key {
            KEY_CREAM_LESS => self.service.menu_idx = add_wrap(self.service.menu_idx, len, false),
            KEY_CREAM_MORE => self.service.menu_idx = add_wrap(self.service.menu_idx, len, true),
            _ if e.is_accept() => return SERVICE_MENU[self.service.menu_idx].1,
            _ if e.is_reject() => return UiState::ServiceEnd,
            _ if e.is_digit() => {
                let x = usize::from(e.key - u16::from(b'0'));
                if (1..=len).contains(&x) {
                    self.service.menu_idx = x - 1;
                }
            }
            _ => {}
        }
        UiState::ServiceMenu
    }

    pub(crate) async fn on_service_inventory(&mut self) -> UiState {
        let Some(stock) = self.service.inv_list.get(self.service.inv_idx).cloned() else {
            self.service_error("inv empty").await;
            return UiState::ServiceMenu;
        };
        self.display.set_lines(
            Some(&format!("I{} {}", stock.code(), stock.name())),
            Some(&format!(
                "{:.1} {}\0",
                stock.value(),
                String::from_utf8_lossy(&self.input_buf)
            )),
        );

        let e = match self.service_wait_input().await {
            ControlFlow::Break(next) => return next,
            ControlFlow::Continue(None) => return UiState::ServiceInventory,
            ControlFlow::Continue(Some(e)) => e,
        };
        let len = self.service.inv_list.len();
        match e.key {
            KEY_CREAM_LESS | KEY_CREAM_MORE => {
                if !self.input_buf.is_empty() {
                    self.service_error("set or clear?").await;
                    return UiState::ServiceInventory;
                }
                self.service.inv_idx =
                    add_wrap(self.service.inv_idx, len, e.key == KEY_CREAM_MORE);
            }
            _ if e.is_code_char() => self.input_buf.push(e.key as u8),
            _ if e.is_accept() => {
                if self.input_buf.is_empty() {
                    error!("service inventory accept with empty input");
                    self.service_error("empty").await;
                    return UiState::ServiceInventory;
                }
                let text = String::from_utf8_lossy(&self.input_buf).into_owned();
                self.input_buf.clear();
                match text.parse::<f32>() {
                    Ok(v) => {
                        info!(stock = stock.name(), value = v, "service inventory set");
                        stock.set(v);
                        self.service.ask_report = true;
                    }
                    Err(e) => {
                        error!(input = %text, error = %e, "service inventory input");
                        self.service_error("number-invalid").await;
                    }
                }
            }
            _ if e.is_reject() => {
                if self.input_buf.pop().is_some() {
                    return UiState::ServiceInventory;
                }
                return UiState::ServiceMenu;
            }
            _ => {}
        }
        UiState::ServiceInventory
    }

    pub(crate) async fn on_service_test(&mut self) -> UiState {
        let g = Arc::clone(&self.g);
        self.input_buf.clear();
        let Some((name, doer)) = self.service.tests.get(self.service.test_idx).cloned() else {
            self.service_error("no tests").await;
            return UiState::ServiceMenu;
        };
        let line1 = format!("T{} {name}", self.service.test_idx + 1);
        self.display.set_lines(Some(&line1), Some(""));

        let len = self.service.tests.len();
        loop {
            let e = match self.service_wait_input().await {
                ControlFlow::Break(next) => return next,
                ControlFlow::Continue(None) => return UiState::ServiceTest,
                ControlFlow::Continue(Some(e)) => e,
            };
            match e.key {
                KEY_CREAM_LESS | KEY_CREAM_MORE => {
                    self.service.test_idx =
                        add_wrap(self.service.test_idx, len, e.key == KEY_CREAM_MORE);
                    return UiState::ServiceTest;
                }
                _ if e.is_accept() => {
                    self.display.set_lines(Some(&line1), Some("in progress"));
                    match g.engine.validate_exec(&ExecEnv::new(), &doer).await {
                        Ok(()) => self.display.set_lines(Some(&line1), Some("OK")),
                        Err(e) => {
                            error!(test = %name, error = %e, "service test");
                            g.tele.error(&e);
                            self.display.set_lines(Some(&line1), Some("error"));
                        }
                    }
                }
                _ if e.is_reject() => return UiState::ServiceMenu,
                _ => return UiState::ServiceTest,
            }
        }
    }

    pub(crate) async fn on_service_reboot(&mut self) -> UiState {
        self.display.set_lines(Some("for reboot"), Some("press 1"));
        match self.service_wait_input().await {
            ControlFlow::Break(next) => next,
            ControlFlow::Continue(Some(e)) if e.key == u16::from(b'1') => {
                self.display.set_lines(Some("reboot"), Some("in progress"));
                info!("service reboot requested");
                self.g.request_reboot();
                UiState::Stop
            }
            ControlFlow::Continue(_) => UiState::ServiceMenu,
        }
    }

    pub(crate) async fn on_service_network(&mut self) -> UiState {
        let addr = local_address().unwrap_or_else(|| "no address".to_string());
        self.display.set_lines(Some("network"), Some(&addr));
        loop {
            match self.service_wait_input().await {
                ControlFlow::Break(next) => return next,
                ControlFlow::Continue(Some(e)) if e.is_reject() => return UiState::ServiceMenu,
                ControlFlow::Continue(_) => {}
            }
        }
    }

    pub(crate) async fn on_service_money_load(&mut self) -> UiState {
        let g = Arc::clone(&self.g);
        self.display.set_lines(Some("money-load"), Some("0"));
        self.service.ask_report = true;
        let mut accept = CreditAccept::new(&self.alive);
        let mut loaded = Amount::ZERO;
        let mut restart = true;
        let next = loop {
            let credit = g.money.credit();
            if credit != Amount::ZERO {
                loaded += credit;
                self.display
                    .set_lines(Some("money-load"), Some(&loaded.to_string()));
                if let Err(e) = g.money.withdraw_commit(credit).await {
                    error!(error = %e, "money-load commit");
                }
            }
            if restart {
                restart = false;
                accept
                    .restart(&g.money, Amount(u32::MAX), self.money_tx.clone())
                    .await;
            }
            match self.wait(self.service.reset).await {
                Event::Input(e) if e.is_reject() => break UiState::ServiceMenu,
                Event::Money(MoneyEvent::Credit(_)) => restart = true,
                Event::Stop | Event::Service => break UiState::ServiceEnd,
                _ => {}
            }
        };
        accept.finish().await;
        info!(%loaded, "money-load done");
        next
    }

    pub(crate) async fn on_service_report(&mut self) -> UiState {
        self.service_report().await;
        UiState::ServiceMenu
    }

    async fn service_report(&mut self) {
        let g = Arc::clone(&self.g);
        if let Err(e) = g.tele.report(true) {
            error!(error = %e, "service report");
        }
        let list = ["money.cashbox_zero".to_string()];
        if let Err(e) = self.exec_hooks("service-report", &list).await {
            debug!(error = %e, "service report");
        }
    }

    pub(crate) async fn on_service_end(&mut self) -> UiState {
        let g = Arc::clone(&self.g);
        if let Err(e) = g.inventory.store() {
            error!(error = %e, "inventory store");
        }
        self.input_buf.clear();

        if self.service.ask_report {
            self.display.set_lines(Some("for tele report"), Some("press 1"));
            if let Event::Input(e) = self.wait(self.service.reset).await
                && e.key == u16::from(b'1')
            {
                self.service.ask_report = false;
                self.service_report().await;
            }
        }

        if self
            .exec_hooks("on_service_end", &g.config.engine.on_service_end)
            .await
            .is_err()
        {
            return UiState::Broken;
        }
        UiState::FrontBegin
    }
}

/// Address of the interface that routes outside. Nothing is sent.
fn local_address() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 6, true, 1)]
    #[case(5, 6, true, 0)]
    #[case(0, 6, false, 5)]
    #[case(0, 0, true, 0)]
    fn test_add_wrap(
        #[case] current: usize,
        #[case] len: usize,
        #[case] forward: bool,
        #[case] expect: usize,
    ) {
        assert_eq!(add_wrap(current, len, forward), expect);
    }
}
