//! Interactive bus peer: register under a name, print everything that
//! arrives, optionally fire messages at another peer. `kill -9` one of
//! these and start another to watch slot reclamation happen.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use clap::Parser;
use tracing::info;
use weft_ipc::{Bus, BusConfig};

#[derive(Parser)]
#[command(name = "bus_peer", about = "shared-memory bus peer")]
struct Cli {
    /// Name to register under.
    #[arg(long)]
    name: String,
    /// Peer to send to; listen-only when absent.
    #[arg(long)]
    to: Option<String>,
    #[arg(long, default_value_t = 1)]
    msg_type: i32,
    #[arg(long, default_value = "ping")]
    message: String,
    /// Messages to send before settling into listening.
    #[arg(long, default_value_t = 1)]
    count: u32,
    #[arg(long, default_value_t = weft_ipc::DEFAULT_SHM_KEY)]
    shm_key: i32,
    #[arg(long, default_value_t = weft_ipc::DEFAULT_PROC_COUNT)]
    proc_count: usize,
    #[arg(long, default_value_t = 4096)]
    slot_size: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let cfg = BusConfig {
        shm_key: cli.shm_key,
        proc_count: cli.proc_count,
        slot_size: cli.slot_size,
        ..BusConfig::new(&cli.name)
    };
    let bus = Bus::init(cfg, |sender, msg_type, payload| {
        println!("[{sender}] type={msg_type} {:?}", String::from_utf8_lossy(payload));
    })?;
    info!(name = %bus.name(), "registered");
    for peer in bus.peers() {
        info!(name = %peer.name, slot = peer.slot_size, "peer");
    }

    if let Some(to) = &cli.to {
        for i in 0..cli.count {
            bus.send(to, cli.msg_type, cli.message.as_bytes())?;
            info!(%to, n = i + 1, "sent");
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::Release))?;
    while running.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    drop(bus);
    Ok(())
}
