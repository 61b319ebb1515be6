//! Framed echo over the TCP layer: `tcp_echo serve` echoes every frame
//! back to its sender, `tcp_echo send` connects, sends a message and
//! prints the reply.

use clap::{Parser, Subcommand};
use tracing::info;
use weft_network::{
    ServerConfig,
    tcp::{TcpClient, TcpServer},
};
use weft_utils::ByteBuf;

#[derive(Parser)]
#[command(name = "tcp_echo", about = "framed TCP echo server/client")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the echo server.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 4096)]
        port: u16,
    },
    /// Send one message and wait for the echo.
    Send {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 4096)]
        port: u16,
        #[arg(long, default_value = "hello")]
        message: String,
    },
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().cmd {
        Cmd::Serve { host, port } => serve(&host, port),
        Cmd::Send { host, port, message } => send(&host, port, &message),
    }
}

fn serve(host: &str, port: u16) -> std::io::Result<()> {
    let mut server = TcpServer::bind(ServerConfig::new(host, port), |peer| {
        let id = peer.id();
        info!(id = id.0, addr = ?peer.peer_addr(), "new connection");
        peer.set_data_callback(|ctx, frame| {
            let _ = ctx.send(frame);
        });
        peer.set_close_callback(move |id, err| {
            info!(id = id.0, ?err, "connection gone");
        });
    })
    .map_err(std::io::Error::other)?;

    let handle = server.handle();
    ctrlc::set_handler(move || handle.stop()).expect("install signal handler");
    server.run()
}

fn send(host: &str, port: u16, message: &str) -> std::io::Result<()> {
    let mut client = TcpClient::new(host, port)?;
    let handle = client.handle();
    let stopper = handle.clone();

    // Payloads travel as length-prefixed strings serialised through the
    // byte buffer, the same shape the reply is parsed back out of.
    let mut payload = ByteBuf::new(4096);
    if !payload.write_str(message) {
        return Err(std::io::Error::other("message too large for the send buffer"));
    }
    client.set_open_callback(move |result| match result {
        Ok(peer) => {
            info!(?peer, "connected");
            let _ = handle.send(payload.content());
        }
        Err(err) => eprintln!("connect failed: {err}"),
    });
    client.set_data_callback(move |ctx, frame| {
        let mut reply = ByteBuf::new(4096);
        if reply.set_content(frame) {
            match reply.read_str() {
                Some(text) => println!("{text}"),
                None => println!("{} opaque bytes", frame.len()),
            }
        }
        ctx.close();
    });
    client.set_close_callback(|err| {
        if let Some(err) = err {
            eprintln!("connection lost: {err}");
        }
    });

    ctrlc::set_handler(move || stopper.stop()).expect("install signal handler");
    client.run()
}
