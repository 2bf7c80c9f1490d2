//! Telemetry messages exchanged with the server.
//!
//! Machine to server: [`State`] (one byte, latest wins), [`Telemetry`]
//! (errors, transactions, inventory and money reports) and [`Response`] to
//! a [`Command`]. Server to machine: [`Command`].
//!
//! Over the slim transport every frame payload is one JSON encoded
//! [`Packet`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Machine state as reported to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum State {
    #[default]
    Invalid = 0,
    Boot = 1,
    Nominal = 2,
    Disconnected = 3,
    Problem = 4,
    Service = 5,
    Lock = 6,
}

impl State {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => Self::Boot,
            2 => Self::Nominal,
            3 => Self::Disconnected,
            4 => Self::Problem,
            5 => Self::Service,
            6 => Self::Lock,
            _ => Self::Invalid,
        }
    }
}

/// Scheduling class of a remote command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Same as `IdleEngine`.
    #[default]
    Default,
    /// Run immediately, even while a customer is being served.
    Now,
    /// Wait until the engine is idle.
    IdleEngine,
    /// Wait until no customer interaction is in progress.
    IdleUser,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    #[default]
    Cash,
    Gift,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Telemetry {
    pub vm_id: i32,
    /// Unix time in nanoseconds.
    pub time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TeleErrorReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Inventory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub money_cashbox: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub money_change: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Transaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat: Option<Stat>,
    pub at_service: bool,
    pub build_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleErrorReport {
    pub message: String,
    pub code: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub stocks: Vec<StockItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StockItem {
    pub code: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Integer view of `valuef` for servers that ignore fractions.
    pub value: i32,
    pub valuef: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Money {
    pub total_bills: u32,
    pub total_coins: u32,
    /// Nominal to count.
    pub bills: BTreeMap<u32, u32>,
    pub coins: BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transaction {
    pub code: String,
    /// Tuning values in order: cream, sugar.
    pub options: Vec<i32>,
    pub price: u32,
    pub payment_method: PaymentMethod,
    pub credit_bills: u32,
    pub credit_coins: u32,
}

/// Low priority counters sent along with the next telemetry message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stat {
    pub bill_rejected: BTreeMap<u32, u32>,
    pub coin_rejected: BTreeMap<u32, u32>,
    pub coin_slug: u32,
    pub bill_escrow_rejected: u32,
}

impl Stat {
    pub fn reset(&mut self) {
        *self = Stat::default();
    }

    pub fn is_empty(&self) -> bool {
        self == &Stat::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    pub id: u32,
    /// Topic suffix the response goes to.
    pub reply_topic: String,
    /// Unix nanoseconds after which the command must not run, 0 for none.
    pub deadline: i64,
    pub priority: Priority,
    pub task: CommandTask,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTask {
    #[default]
    Report,
    Lock {
        duration_sec: u32,
    },
    Exec {
        scenario: String,
        #[serde(default)]
        lock: bool,
    },
    SetInventory {
        new: Inventory,
    },
    Stop {
        #[serde(default)]
        timeout_sec: u32,
    },
    SetGiftCredit {
        amount: u32,
    },
    Ping,
    Abort,
}

impl CommandTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Lock { .. } => "lock",
            Self::Exec { .. } => "exec",
            Self::SetInventory { .. } => "set_inventory",
            Self::Stop { .. } => "stop",
            Self::SetGiftCredit { .. } => "set_gift_credit",
            Self::Ping => "ping",
            Self::Abort => "abort",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Response {
    pub command_id: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Routing only, cleared before the response leaves the machine.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reply_topic: String,
}

/// Envelope carried in slim frame payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Packet {
    Hello { vm_id: i32, time: i64 },
    State(State),
    Telemetry(Box<Telemetry>),
    Response { topic: String, response: Response },
    Command(Command),
}

impl Packet {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(b)?)
    }
}

/// Topic prefix shared by everything a machine publishes or subscribes to.
pub fn topic_prefix(vm_id: i32) -> String {
    format!("vm{vm_id}")
}

pub fn topic_state(vm_id: i32) -> String {
    format!("{}/w/1s", topic_prefix(vm_id))
}

pub fn topic_telemetry(vm_id: i32) -> String {
    format!("{}/w/1t", topic_prefix(vm_id))
}

pub fn topic_command(vm_id: i32) -> String {
    format!("{}/r/c", topic_prefix(vm_id))
}

pub fn topic_response(vm_id: i32, suffix: &str) -> String {
    format!("{}/{suffix}", topic_prefix(vm_id))
}
