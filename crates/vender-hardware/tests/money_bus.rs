//! Coin acceptor and bill validator sharing one scripted bus.

use std::sync::Arc;
use std::time::Duration;

use vender_core::{Amount, Nominal};
use vender_hardware::mdb::bill::BillConfig;
use vender_hardware::mdb::coin::CoinConfig;
use vender_hardware::mdb::{BillValidator, Bus, CoinAcceptor, Delays, MockUart, MockUartHandle, UartDriver};
use vender_hardware::money::{Devicer, PollItem, PollStatus};

const COIN_SETUP: &str = "03 1643 01 02 0003 01 02 05 0a";
const BILL_SETUP: &str = "01 1643 0005 02 0064 ffff ff 01 02 04 00000000 00000000 00000000 00";

async fn devices() -> (Devicer, Devicer, MockUartHandle) {
    let (uart, mock) = MockUart::new();
    let bus = Arc::new(Bus::new(UartDriver::Mock(uart)));
    let coin = CoinAcceptor::new(
        bus.clone(),
        CoinConfig {
            delays: Delays::FAST,
            dispense_timeout: Duration::from_millis(200),
            ..CoinConfig::default()
        },
    );
    let bill = BillValidator::new(
        bus,
        BillConfig {
            delays: Delays::FAST,
            ..BillConfig::default()
        },
    );
    mock.expect("08", "");
    mock.expect("09", COIN_SETUP);
    mock.expect("0a", "0000 00 00 04 02");
    mock.expect("0c0000ffff", "");
    mock.expect("30", "");
    mock.expect("31", BILL_SETUP);
    mock.expect("36", "0010");
    mock.expect("3400000000", "");
    let coin = Devicer::Coin(Arc::new(coin));
    let bill = Devicer::Bill(Arc::new(bill));
    coin.init().await.unwrap();
    bill.init().await.unwrap();
    assert!(mock.leftover().is_empty());
    (coin, bill, mock)
}

#[tokio::test]
async fn test_accept_limits_per_device() {
    let (coin, bill, mock) = devices().await;
    mock.expect("0c000fffff", "");
    mock.expect("3400030003", "");
    coin.accept_max(Amount(10)).await.unwrap();
    bill.accept_max(Amount(10)).await.unwrap();
    assert!(mock.leftover().is_empty());
}

#[tokio::test]
async fn test_escrow_then_stack() {
    let (_coin, bill, mock) = devices().await;
    mock.expect("33", "92");
    let result = bill.poll().await;
    assert_eq!(
        result.items,
        vec![PollItem::money(PollStatus::Escrow, Nominal(20), 1)]
    );
    mock.expect("3501", "");
    bill.escrow_accept().await.unwrap();
    mock.expect("33", "82");
    let result = bill.poll().await;
    assert_eq!(result.items[0].amount(), Amount(20));
    assert!(result.items[0].cashbox);
}

#[tokio::test]
async fn test_coin_change_from_tubes() {
    let (coin, bill, mock) = devices().await;
    assert_eq!(coin.tubes().total(), Amount(40));
    // give_smart refreshes tubes, dispense checks them before and after
    mock.expect("0a", "0000 00 00 04 02");
    mock.expect("0a", "0000 00 00 04 02");
    mock.expect("0d13", "");
    mock.expect("0b", "");
    mock.expect("0a", "0000 00 00 04 01");
    let given = coin.give(Amount(10), false).await.unwrap();
    assert_eq!(given.total(), Amount(10));
    assert!(mock.leftover().is_empty());
    assert!(bill.give(Amount(5), false).await.is_err());
    assert!(coin.escrow_accept().await.is_err());
}
