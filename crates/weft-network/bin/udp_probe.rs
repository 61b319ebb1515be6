//! UDP probe node: binds a port, prints every datagram it receives, and
//! optionally fires a probe at a peer once up.

use clap::Parser;
use tracing::info;
use weft_network::{NodeConfig, udp::UdpNode};

#[derive(Parser)]
#[command(name = "udp_probe", about = "datagram probe node")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// 0 binds an ephemeral port.
    #[arg(long, default_value_t = 0)]
    port: u16,
    #[arg(long)]
    broadcast: bool,
    /// host:port to probe once the node is up.
    #[arg(long)]
    probe: Option<String>,
    #[arg(long, default_value = "ping")]
    message: String,
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let cfg = NodeConfig { broadcast: cli.broadcast, ..Default::default() };
    let mut node = UdpNode::new(cfg)?;
    info!(id = node.id().0, "node constructed");

    let probe = cli.probe.clone();
    let message = cli.message.clone();
    let sender = node.handle();
    node.set_open_callback(move |result| match result {
        Ok(local) => {
            info!(?local, "listening");
            if let Some(target) = probe {
                let (host, port) = target
                    .rsplit_once(':')
                    .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_owned(), p)))
                    .expect("--probe must be host:port");
                sender.send_async(&host, port, message.into_bytes(), |result| match result {
                    Ok(n) => info!(bytes = n, "probe sent"),
                    Err(err) => eprintln!("probe failed: {err}"),
                });
            }
        }
        Err(err) => eprintln!("open failed: {err}"),
    });
    node.set_data_callback(|peer, data| {
        println!("{peer} -> {}", String::from_utf8_lossy(data));
    });

    let stopper = node.handle();
    ctrlc::set_handler(move || stopper.stop()).expect("install signal handler");
    node.run(&cli.host, cli.port)
}
