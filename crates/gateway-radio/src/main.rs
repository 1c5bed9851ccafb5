//! Radio node binary
//!
//! Wires the stores, scheduler, stack ingest, and serial link together.
//! Without vendor radio hardware the loopback stack is used, which logs
//! outgoing commands and synthesizes discovery responses.

use std::sync::Arc;
use std::time::Duration;

use gateway_core::event::EventBus;
use gateway_core::registry::DeviceRegistry;
use gateway_radio::link::start_link;
use gateway_radio::radio::LoopbackRadio;
use gateway_radio::runtime::{spawn_ingest, RadioContext};
use gateway_radio::scheduler::Scheduler;
use serial2::SerialPort;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Link baud rate: 460800 8N1, no flow control.
const LINK_BAUD: u32 = 460_800;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway_radio=info,link_protocol=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = std::env::var("GW_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let registry_path = std::path::PathBuf::from(&data_dir).join("devices.bin");

    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(DeviceRegistry::open(registry_path).await);
    tracing::info!("registry loaded: {} devices", registry.len());

    let ctx = RadioContext::new(registry.clone(), bus.clone());

    let (stack_tx, stack_rx) = mpsc::channel(64);
    let radio = LoopbackRadio::new(stack_tx);
    let scheduler = Scheduler::start(radio, registry, bus);
    spawn_ingest(ctx.clone(), scheduler.clone(), stack_rx);

    match std::env::var("GW_LINK_PORT") {
        Ok(path) => {
            let mut port = SerialPort::open(&path, LINK_BAUD)?;
            port.set_read_timeout(Duration::from_millis(100))?;
            start_link(ctx, scheduler, port)
                .map_err(|e| anyhow::anyhow!("link start failed: {e}"))?;
            tracing::info!("serial link started on {} at {} baud", path, LINK_BAUD);
        }
        Err(_) => {
            tracing::warn!("GW_LINK_PORT not set, running without host link");
        }
    }

    // Subsystems run on their own tasks from here on.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
