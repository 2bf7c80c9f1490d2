//! Customer UI scenarios on mock hardware.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{Builder, Env, menu_item, stock};
use tokio_util::sync::CancellationToken;
use vender_core::{Amount, Config};
use vender_engine::{Doer, EngineError};
use vender_hardware::display::State;
use vender_hardware::input::event::{KEY_ACCEPT, KEY_CREAM_MORE, KEY_REJECT, KEY_SUGAR_LESS};
use vender_protocol::tele::Priority;
use vender_ui::UiState;
use vender_ui::tune::{SCALE_ALPHA, format_scale};

fn tune_lines(env: &Env, label: &str, value: u8, max: u8) -> State {
    let d = &env.display;
    let mut l2 = b"- ".to_vec();
    l2.extend_from_slice(&format_scale(value, 0, max, &SCALE_ALPHA));
    l2.extend_from_slice(b" +");
    State {
        l1: d.just_center(&d.translate(&format!("{label}  /{value}"))),
        l2: d.just_center(&l2),
    }
}

fn credit_line(credit: Amount) -> String {
    format!("Кредит:{credit}")
}

#[tokio::test]
async fn test_menu_select_with_tuning() {
    let mut config = Config::default();
    config.engine.inventory.stock = vec![
        stock("cream", 1, "ignore(?)"),
        stock("sugar", 2, "ignore(?)"),
    ];
    config.engine.menu.item = vec![menu_item("1", 0, "add.cream(10) add.sugar(10)")];
    let mut env = Builder::new(config)
        .start(UiState::Boot, UiState::FrontEnd)
        .await;
    env.g.inventory.must_get("cream").unwrap().set(100.0);
    env.g.inventory.must_get("sugar").unwrap().set(200.0);

    env.expect("hello", "").await;
    env.key_code(KEY_CREAM_MORE).await;
    let want = tune_lines(&env, "Сливки", 5, 6);
    env.expect_state(want).await;
    env.key_code(KEY_SUGAR_LESS).await;
    let want = tune_lines(&env, "Сахар", 3, 8);
    env.expect_state(want).await;
    env.key_code(KEY_SUGAR_LESS).await;
    let want = tune_lines(&env, "Сахар", 2, 8);
    env.expect_state(want).await;
    env.key(b'1').await;
    env.expect(&credit_line(Amount::ZERO), "код:1\0").await;
    env.key_code(KEY_ACCEPT).await;
    env.expect("спасибо", "готовлю").await;
    env.finish().await;

    // cream 10 x 1.25 = 12.5 rounds to 13, sugar 10 x 0.5 = 5
    assert_eq!(env.g.inventory.must_get("cream").unwrap().value(), 87.0);
    assert_eq!(env.g.inventory.must_get("sugar").unwrap().value(), 195.0);
}

#[tokio::test]
async fn test_code_editing_and_invalid_code() {
    let mut config = Config::default();
    config.engine.menu.item = vec![menu_item("1", 0, "ignore(1)")];
    let mut env = Builder::new(config)
        .start(UiState::Boot, UiState::FrontAccept)
        .await;

    env.expect("hello", "").await;
    env.key_code(KEY_ACCEPT).await;
    env.expect("error", "нажимайте цифры").await;
    env.key(b'2').await;
    env.expect(&credit_line(Amount::ZERO), "код:2\0").await;
    env.key_code(KEY_ACCEPT).await;
    env.expect("error", "проверьте код").await;
    env.key_code(KEY_REJECT).await;
    env.expect("hello", "").await;
    env.key(b'1').await;
    env.key_code(KEY_ACCEPT).await;
    env.expect_ui_state(UiState::FrontAccept).await;
    env.finish().await;
}

#[tokio::test]
async fn test_insufficient_credit_then_coins() {
    let mut config = Config::default();
    config.money.scale = 100;
    config.engine.menu.item = vec![menu_item("1", 3, "ignore(1)")];
    let mut env = Builder::new(config)
        .with_coin()
        .start(UiState::Boot, UiState::FrontEnd)
        .await;

    env.expect("hello", "").await;
    env.key(b'1').await;
    env.expect(&credit_line(Amount::ZERO), "код:1\0").await;
    env.key_code(KEY_ACCEPT).await;
    env.expect(
        "добавьте денег",
        &format!("{}/{}", credit_line(Amount::ZERO), Amount(300)),
    )
    .await;

    env.inject_coin(200);
    env.expect(&credit_line(Amount(200)), "код:1\0").await;
    env.inject_coin(100);
    env.expect(&credit_line(Amount(300)), "код:1\0").await;
    env.key_code(KEY_ACCEPT).await;
    env.expect("спасибо", "готовлю").await;
    env.finish().await;
    assert_eq!(env.g.money.credit(), Amount::ZERO);
}

#[tokio::test]
async fn test_menu_error_breaks_machine() {
    let mut config = Config::default();
    config.engine.menu.item = vec![menu_item("1", 0, "brew")];
    let mut env = Builder::new(config)
        .with_action(
            "brew",
            Doer::func("brew", |_| async {
                Err(EngineError::action("brew", std::io::Error::other("jammed")))
            }),
        )
        .start(UiState::Boot, UiState::Broken)
        .await;

    env.expect("hello", "").await;
    env.key(b'1').await;
    env.key_code(KEY_ACCEPT).await;
    env.expect("error", "please check code").await;
    env.expect_ui_state(UiState::Broken).await;
    env.finish().await;
}

#[tokio::test]
async fn test_boot_failure_is_broken() {
    let mut config = Config::default();
    config.engine.on_boot = vec!["missing".to_string()];
    let mut env = Builder::new(config)
        .start(UiState::Boot, UiState::Stop)
        .await;
    env.expect_ui_state(UiState::Broken).await;
    env.expect("broken", "").await;
    env.stop().await;
}

#[tokio::test]
async fn test_select_timeout() {
    let mut config = Config::default();
    config.ui.front.reset_sec = 1;
    config.engine.menu.item = vec![menu_item("1", 0, "ignore(1)")];
    let mut env = Builder::new(config)
        .start(UiState::Boot, UiState::FrontTimeout)
        .await;
    env.expect("hello", "").await;
    env.key(b'1').await;
    env.expect_ui_state(UiState::FrontTimeout).await;
    env.finish().await;
}

#[tokio::test]
async fn test_remote_lock_parks_ui() {
    let mut config = Config::default();
    config.engine.menu.item = vec![menu_item("1", 0, "ignore(1)")];
    let mut env = Builder::new(config)
        .start(UiState::Boot, UiState::Stop)
        .await;
    env.expect("hello", "").await;

    let lock = Arc::clone(&env.g.lock);
    let stop = CancellationToken::new();
    let waiter = {
        let stop = stop.clone();
        tokio::spawn(async move { lock.lock_wait(Priority::Default, &stop).await })
    };
    env.expect_ui_state(UiState::Locked).await;
    env.expect("locked", "").await;
    let got = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(got);

    env.g.lock.lock_decrement_wait();
    env.expect_ui_state(UiState::FrontSelect).await;
    env.expect("hello", "").await;
    env.stop().await;
}

#[tokio::test]
async fn test_lock_while_broken_keeps_broken_hooks_once() {
    let mut config = Config::default();
    config.engine.on_boot = vec!["missing".to_string()];
    config.engine.on_broken = vec!["alarm".to_string()];
    let alarms = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&alarms);
    let mut env = Builder::new(config)
        .with_action(
            "alarm",
            Doer::func("alarm", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }),
        )
        .start(UiState::Boot, UiState::Stop)
        .await;
    env.expect_ui_state(UiState::Broken).await;
    env.expect("broken", "").await;
    assert_eq!(alarms.load(Ordering::SeqCst), 1);

    let lock = Arc::clone(&env.g.lock);
    let stop = CancellationToken::new();
    let waiter = tokio::spawn(async move { lock.lock_wait(Priority::Default, &stop).await });
    env.expect_ui_state(UiState::Locked).await;
    env.expect("locked", "").await;
    let got = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(got);

    env.g.lock.lock_decrement_wait();
    env.expect_ui_state(UiState::Broken).await;
    env.expect("broken", "").await;
    assert_eq!(alarms.load(Ordering::SeqCst), 1);
    env.stop().await;
}
