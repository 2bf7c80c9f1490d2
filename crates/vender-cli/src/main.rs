//! Vending machine controller entry point.
//!
//! ```text
//! vender run  --config /home/vender/config.toml   full machine: hardware, engine, UI, telemetry
//! vender mdb  --config ...                         MDB bus REPL
//! vender mega --config ...                         coprocessor REPL
//! ```
//!
//! Logging follows `RUST_LOG` (default `info`).

mod repl;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use vender_core::Config;
use vender_hardware::mdb::{Bus, Packet};
use vender_hardware::mega;
use vender_ui::global::{open_mdb, open_mega};
use vender_ui::{Global, Ui};

use crate::repl::Target;

#[derive(Parser, Debug)]
#[command(name = "vender")]
#[command(version, about = "Vending machine controller", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the machine
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Interactive MDB bus console
    Mdb {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Interactive coprocessor console
    Mega {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    match args.command {
        Cmd::Run { config } => run(load(&config)?).await,
        Cmd::Mdb { config } => mdb_repl(load(&config)?).await,
        Cmd::Mega { config } => mega_repl(load(&config)?).await,
    }
}

fn load(path: &Path) -> Result<Config> {
    let config =
        Config::read_file(path).with_context(|| format!("config {}", path.display()))?;
    info!(path = %path.display(), vm_id = config.tele.vm_id, "config loaded");
    Ok(config)
}

/// Cancel `alive` on Ctrl-C.
fn stop_on_signal(alive: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            () = alive.cancelled() => {}
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    warn!(error = %e, "signal handler");
                }
                info!("interrupt, stopping");
                alive.cancel();
            }
        }
    });
}

async fn run(config: Config) -> Result<()> {
    info!(version = vender_core::VERSION, "vender start");
    let g = Global::init(config).await.context("global init")?;
    stop_on_signal(g.alive().clone());

    let mut ui = Ui::init(Arc::clone(&g)).await.context("ui init")?;
    let result = ui.run().await;
    g.close().await;
    result.context("ui")?;
    if g.reboot_requested() {
        info!("reboot requested by service menu");
    }
    info!("vender stop");
    Ok(())
}

struct MdbTarget {
    bus: Arc<Bus>,
}

impl Target for MdbTarget {
    async fn tx(&self, data: &[u8]) -> repl::Result<String> {
        let request = Packet::from_bytes(data)?;
        let response = self.bus.tx(&request).await?;
        Ok(response.to_string())
    }

    async fn reset(&self) -> repl::Result<()> {
        self.bus.reset_default().await?;
        Ok(())
    }

    fn set_log(&self, on: bool) {
        self.bus.set_debug(on);
    }
}

async fn mdb_repl(config: Config) -> Result<()> {
    let alive = CancellationToken::new();
    stop_on_signal(alive.clone());
    let hw = &config.hardware;
    let client = if hw.mdb.uart_driver == "mega" {
        Some(open_mega(hw, &alive).await.context("mega open")?)
    } else {
        None
    };
    let bus = open_mdb(hw, client.as_ref()).await.context("mdb open")?;
    info!(driver = bus.driver_name().await, device = %hw.mdb.uart_device, "mdb repl, type help");

    let target = MdbTarget {
        bus: Arc::clone(&bus),
    };
    repl::run(&target, BufReader::new(tokio::io::stdin()), &alive).await?;
    if let Err(e) = bus.close().await {
        warn!(error = %e, "mdb close");
    }
    alive.cancel();
    Ok(())
}

struct MegaTarget {
    client: Arc<mega::Client>,
    log: AtomicBool,
}

impl Target for MegaTarget {
    /// First byte is the command, the rest its payload; length and CRC are
    /// added here.
    async fn tx(&self, data: &[u8]) -> repl::Result<String> {
        let (&command, payload) = data
            .split_first()
            .ok_or_else(|| vender_hardware::HardwareError::packet_invalid("empty command"))?;
        let frame = mega::protocol::encode(command, payload);
        if self.log.load(Ordering::Relaxed) {
            debug!(frame = %vender_core::hex::encode(&frame), "mega send");
        }
        let packets = self.client.raw(&frame).await?;
        let answer: Vec<String> = packets.iter().map(|p| format!("{p:?}")).collect();
        Ok(answer.join(" "))
    }

    async fn reset(&self) -> repl::Result<()> {
        let keep = vender_hardware::mdb::bus::DEFAULT_BREAK_KEEP;
        let ms = u16::try_from(keep.as_millis()).unwrap_or(u16::MAX);
        let p = self.client.tx(mega::Command::MdbBusReset, &ms.to_be_bytes()).await?;
        println!("< {p:?}");
        Ok(())
    }

    fn set_log(&self, on: bool) {
        self.log.store(on, Ordering::Relaxed);
    }
}

async fn mega_repl(config: Config) -> Result<()> {
    let alive = CancellationToken::new();
    stop_on_signal(alive.clone());
    let client = open_mega(&config.hardware, &alive)
        .await
        .context("mega open")?;
    info!(spi = %config.hardware.mega.spi, "mega repl, type help");

    let target = MegaTarget {
        client: Arc::clone(&client),
        log: AtomicBool::new(false),
    };
    repl::run(&target, BufReader::new(tokio::io::stdin()), &alive).await?;
    let stat = client.stat();
    debug!(?stat, "mega stat");
    client.close();
    alive.cancel();
    Ok(())
}
