use std::sync::Arc;

use tracing::{debug, error, info};
use vender_core::Amount;
use vender_engine::ExecEnv;
use vender_hardware::display::MAX_WIDTH;
use vender_hardware::input::InputEvent;
use vender_hardware::input::event::{
    EVEND_KEYBOARD_TAG, KEY_CREAM_LESS, KEY_CREAM_MORE, KEY_SUGAR_LESS, KEY_SUGAR_MORE,
};
use vender_protocol::tele::{PaymentMethod, Priority, State, Transaction};

use crate::event::Event;
use crate::money::MoneyEvent;
use crate::state::UiState;
use crate::tune::{SCALE_ALPHA, format_scale, scale_tune_rate};
use crate::ui::{CreditAccept, Ui};

impl Ui {
    pub(crate) async fn on_front_begin(&mut self) -> UiState {
        let g = Arc::clone(&self.g);
        let config = &g.config.ui.front;
        self.input_buf.clear();
        self.front.item = None;
        self.front.cream = config.default_cream;
        self.front.sugar = config.default_sugar;

        if self
            .exec_hooks("on_front_begin", &g.config.engine.on_front_begin)
            .await
            .is_err()
        {
            return UiState::Broken;
        }
        match self.menu.max_price(&g.engine) {
            Ok(max) => self.front.max_price = max,
            Err(e) => {
                error!(error = %e, "menu");
                g.tele.error(&e);
                return UiState::Broken;
            }
        }
        g.tele.state(State::Nominal);
        UiState::FrontSelect
    }

    /// Handles both select and tune: in tune mode the display keeps the
    /// scale and a short timeout returns to select.
    pub(crate) async fn on_front_select(&mut self, tune: bool) -> UiState {
        let mut accept = CreditAccept::new(&self.alive);
        accept
            .restart(&self.g.money, self.front.max_price, self.money_tx.clone())
            .await;
        let next = self.front_select_loop(tune, &mut accept).await;
        accept.finish().await;
        next
    }

    async fn front_select_loop(&mut self, tune: bool, accept: &mut CreditAccept) -> UiState {
        let g = Arc::clone(&self.g);
        let timeout = if tune { self.tune_timeout } else { self.front_reset };
        let mut refresh = !tune;
        loop {
            if refresh {
                self.front_select_show(g.money.credit());
            }
            refresh = false;
            match self.wait(timeout).await {
                Event::Input(e) => {
                    if e.is_money_abort() {
                        if let Err(e) = g.money.abort().await {
                            error!(error = %e, "money abort");
                        }
                        return UiState::FrontEnd;
                    }
                    if is_tune_key(&e) {
                        return self.front_tune_input(&e);
                    }
                    if e.is_code_char() {
                        self.input_buf.push(e.key as u8);
                    } else if e.is_reject() {
                        if self.input_buf.pop().is_none() {
                            continue;
                        }
                    } else if e.is_accept() {
                        if let Some(next) = self.front_select_accept() {
                            return next;
                        }
                        continue;
                    } else {
                        debug!(input = %e, "front input ignored");
                        continue;
                    }
                    if tune {
                        return UiState::FrontSelect;
                    }
                    refresh = true;
                }
                Event::Money(MoneyEvent::Credit(amount)) => {
                    debug!(%amount, "front credit");
                    accept
                        .restart(&g.money, self.front.max_price, self.money_tx.clone())
                        .await;
                    refresh = !tune;
                }
                Event::Money(MoneyEvent::Gift(_)) => refresh = !tune,
                Event::Service => return UiState::ServiceBegin,
                Event::Time if tune => return UiState::FrontSelect,
                Event::Time => return UiState::FrontTimeout,
                Event::Lock => {
                    let busy = g.money.credit() != Amount::ZERO || !self.input_buf.is_empty();
                    if g.lock.priority() == Priority::IdleUser && busy {
                        debug!("lock deferred, customer active");
                        continue;
                    }
                    return UiState::FrontEnd;
                }
                Event::Stop => return UiState::FrontEnd,
            }
        }
    }

    fn front_select_show(&self, credit: Amount) {
        let config = &self.g.config.ui.front;
        if credit == Amount::ZERO && self.input_buf.is_empty() {
            self.display.set_lines(Some(&config.msg_intro), Some(""));
            return;
        }
        let l1 = format!("{}{}", config.msg_credit, credit);
        let l2 = config
            .msg_input_code
            .replace("{}", &String::from_utf8_lossy(&self.input_buf));
        self.display.set_lines(Some(&l1), Some(&l2));
    }

    /// Check the entered code. `None` keeps waiting with an error shown.
    fn front_select_accept(&mut self) -> Option<UiState> {
        let g = Arc::clone(&self.g);
        let config = &g.config.ui.front;
        let show = |l2: &str| self.display.set_lines(Some(&config.msg_error), Some(l2));
        if self.input_buf.is_empty() {
            show(&config.msg_menu_code_empty);
            return None;
        }
        let code = String::from_utf8_lossy(&self.input_buf).into_owned();
        let Some(item) = self.menu.get(&code) else {
            show(&config.msg_menu_code_invalid);
            return None;
        };
        let credit = g.money.credit();
        debug!(price = %item.price, %credit, "compare");
        if item.price > credit {
            self.display.set_lines(
                Some(&config.msg_menu_insufficient_credit),
                Some(&format!("{}{}/{}", config.msg_credit, credit, item.price)),
            );
            return None;
        }
        if let Err(e) = item.doer.validate(&g.engine) {
            error!(code = %item.code, error = %e, "selected item unavailable");
            show(&config.msg_menu_not_available);
            return None;
        }
        self.front.item = Some(item.clone());
        Some(UiState::FrontAccept)
    }

    fn front_tune_input(&mut self, e: &InputEvent) -> UiState {
        let config = &self.g.config.ui.front;
        let (label, value, max) = match e.key {
            KEY_CREAM_LESS => {
                self.front.cream = self.front.cream.saturating_sub(1);
                (&config.msg_cream, self.front.cream, config.max_cream)
            }
            KEY_CREAM_MORE => {
                self.front.cream = self.front.cream.saturating_add(1).min(config.max_cream);
                (&config.msg_cream, self.front.cream, config.max_cream)
            }
            KEY_SUGAR_LESS => {
                self.front.sugar = self.front.sugar.saturating_sub(1);
                (&config.msg_sugar, self.front.sugar, config.max_sugar)
            }
            KEY_SUGAR_MORE => {
                self.front.sugar = self.front.sugar.saturating_add(1).min(config.max_sugar);
                (&config.msg_sugar, self.front.sugar, config.max_sugar)
            }
            _ => return UiState::FrontSelect,
        };
        let t1 = self.display.translate(&format!("{label}  /{value}"));
        let mut t2 = Vec::with_capacity(MAX_WIDTH);
        t2.extend_from_slice(b"- ");
        t2.extend_from_slice(&format_scale(value, 0, max, &SCALE_ALPHA));
        t2.extend_from_slice(b" +");
        self.display.set_lines_bytes(
            Some(&self.display.just_center(&t1)),
            Some(&self.display.just_center(&t2)),
        );
        UiState::FrontTune
    }

    pub(crate) async fn on_front_accept(&mut self) -> UiState {
        let g = Arc::clone(&self.g);
        let config = &g.config.ui.front;
        let Some(item) = self.front.item.take() else {
            error!("front accept without selected item");
            return UiState::FrontEnd;
        };
        let money = &g.money;
        let transaction = Transaction {
            code: item.code.clone(),
            options: vec![i32::from(self.front.cream), i32::from(self.front.sugar)],
            price: item.price.0,
            payment_method: if money.gift_credit() == Amount::ZERO {
                PaymentMethod::Cash
            } else {
                PaymentMethod::Gift
            },
            credit_bills: money.bill_credit().0,
            credit_coins: money.coin_credit().0,
        };

        info!(code = %item.code, price = %item.price, "front accept");
        if let Err(e) = money.withdraw_prepare(item.price).await {
            error!(error = %e, "CRITICAL withdraw prepare");
        }
        let mut env = ExecEnv::with_price(item.price);
        for (stock, value, max, center) in [
            ("cream", self.front.cream, config.max_cream, config.default_cream),
            ("sugar", self.front.sugar, config.max_sugar, config.default_sugar),
        ] {
            let rate = scale_tune_rate(value, max, center);
            if rate == 1.0 {
                continue;
            }
            debug!(stock, rate, "tuning");
            if let Err(e) = g.inventory.with_tuning(&mut env, stock, rate) {
                error!(stock, error = %e, "tuning");
            }
        }
        self.display
            .set_lines(Some(&config.msg_making1), Some(&config.msg_making2));

        let result = g.engine.exec(&env, &item.doer).await;
        if let Err(e) = g.inventory.store() {
            error!(error = %e, "critical inventory persist");
            g.tele.error(&e);
        }
        match result {
            Ok(()) => {
                if money.credit() != Amount::ZERO
                    && let Err(e) = money.withdraw_commit(item.price).await
                {
                    error!(error = %e, "withdraw commit");
                }
                g.tele.transaction(transaction);
                UiState::FrontEnd
            }
            Err(e) => {
                let e = e.annotate(format!("execute menu:{}", item.code));
                error!(error = %e, "front accept");
                self.display
                    .set_lines(Some(&config.msg_error), Some(&config.msg_menu_error));
                g.tele.error(&e);
                if self
                    .exec_hooks("on_menu_error", &g.config.engine.on_menu_error)
                    .await
                    .is_ok()
                {
                    info!("on_menu_error success");
                }
                UiState::Broken
            }
        }
    }
}

fn is_tune_key(e: &InputEvent) -> bool {
    e.source == EVEND_KEYBOARD_TAG
        && matches!(
            e.key,
            KEY_CREAM_LESS | KEY_CREAM_MORE | KEY_SUGAR_LESS | KEY_SUGAR_MORE
        )
}
