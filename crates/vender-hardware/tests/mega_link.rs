//! Keyboard and MDB traffic multiplexed over one coprocessor link.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vender_hardware::input::event::KEY_ACCEPT;
use vender_hardware::input::{AnySource, Dispatcher, EvendKeyboard};
use vender_hardware::mdb::{Bus, MegaUart, Packet, UartDriver};
use vender_hardware::mega::client::response_buffer;
use vender_hardware::mega::{Client, ClientConfig, Command, Header, MockPin, MockSpi, MockSpiHandle};

async fn client() -> (Arc<Client>, MockSpiHandle, CancellationToken) {
    let (spi, handle) = MockSpi::new();
    let (pin, _pin) = MockPin::new();
    handle.set_responder(|req| match Command::from_byte(req[1]) {
        Some(Command::Reset | Command::Poll) => Some(response_buffer(&[(Header::Ok, &[])])),
        Some(Command::MdbTransaction) => Some(response_buffer(&[
            (Header::MdbStarted, &[]),
            (Header::MdbSuccess, &[0x0b]),
        ])),
        _ => None,
    });
    let stop = CancellationToken::new();
    let config = ClientConfig {
        backup_tick: Duration::from_millis(2),
        response_timeout: Duration::from_millis(300),
    };
    let client = Client::open(spi, pin, config, &stop).await.unwrap();
    (client, handle, stop)
}

#[tokio::test]
async fn test_keyboard_reaches_subscriber() {
    let (client, spi, stop) = client().await;
    let keyboard = EvendKeyboard::new(client.clone()).unwrap();
    let dispatcher = Dispatcher::new(&stop);
    let mut events = dispatcher
        .subscribe_chan("ui", CancellationToken::new())
        .await
        .unwrap();
    dispatcher.add_source(AnySource::Evend(keyboard));

    spi.push_read(response_buffer(&[
        (Header::Twi, &[0x00, b'7']),
        (Header::Twi, &[0x00, 0x0d]),
    ]));
    let ev = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev.as_char(), Some('7'));
    let ev = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev.key, KEY_ACCEPT);
    assert!(client.stat().twi.load(std::sync::atomic::Ordering::Relaxed) >= 2);

    dispatcher.shutdown().await;
    stop.cancel();
}

#[tokio::test]
async fn test_mdb_over_mega() {
    let (client, _spi, stop) = client().await;
    let bus = Bus::open(UartDriver::Mega(MegaUart::new(client.clone())), "")
        .await
        .unwrap();
    assert_eq!(client.refcount(), 1);
    let response = bus.tx(&Packet::from_hex("0b").unwrap()).await.unwrap();
    assert_eq!(response.bytes(), &[0x0b]);
    bus.close().await.unwrap();
    assert!(client.is_closed());
    stop.cancel();
}
