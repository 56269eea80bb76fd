//! Echo client: sends random payloads over parallel streams and checks they come back intact.
//!
//! Run against the `server` example with `cargo run --example client -- --psk secret`.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use minquic::{ClientConfig, Endpoint, IdleTimeout, TransportConfig, VarInt};
use rand::RngCore;
use tracing::{info, info_span, Instrument as _};

#[derive(Parser, Debug)]
#[clap(name = "client")]
struct Opt {
    /// Address of the echo server
    #[clap(default_value = "[::1]:4433")]
    server: SocketAddr,
    /// Pre-shared key both sides derive packet protection from
    #[clap(long = "psk", default_value = "minquic")]
    psk: String,
    /// Number of concurrent streams to open
    #[clap(long = "streams", default_value = "4")]
    streams: usize,
    /// Payload size per stream, in bytes
    #[clap(long = "size", default_value = "1048576")]
    size: usize,
    /// Idle timeout in milliseconds
    #[clap(long = "idle-timeout", default_value = "10000")]
    idle_timeout: u32,
}

fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish(),
    )
    .unwrap();
    let opt = Opt::parse();
    let code = {
        if let Err(e) = run(opt) {
            eprintln!("ERROR: {e}");
            1
        } else {
            0
        }
    };
    ::std::process::exit(code);
}

#[tokio::main]
async fn run(options: Opt) -> Result<()> {
    let mut transport = TransportConfig::default();
    let idle_timeout = IdleTimeout::from(VarInt::from_u32(options.idle_timeout));
    transport.max_idle_timeout(Some(idle_timeout));
    let mut client_config = ClientConfig::with_psk(options.psk.as_bytes());
    client_config.transport_config(transport.into());

    let bind = match options.server {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let mut endpoint = Endpoint::client(bind)?;
    endpoint.set_default_client_config(client_config);

    let start = Instant::now();
    let conn = endpoint
        .connect(options.server)?
        .await
        .context("failed to connect")?;
    eprintln!("connected at {:?}", start.elapsed());

    let start = Instant::now();
    let tasks = (0..options.streams)
        .map(|i| {
            let conn = conn.clone();
            let size = options.size;
            tokio::spawn(echo_once(conn, size).instrument(info_span!("stream", i)))
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await??;
    }
    let elapsed = start.elapsed();

    let total = (options.streams * options.size * 2) as f64;
    eprintln!(
        "echoed {} streams of {} bytes in {:?} ({:.2} MiB/s)",
        options.streams,
        options.size,
        elapsed,
        total / elapsed.as_secs_f64().max(f64::EPSILON) / (1024.0 * 1024.0)
    );
    let stats = conn.stats();
    info!(
        rtt = ?conn.rtt(),
        sent = stats.datagrams_sent,
        received = stats.datagrams_received,
        lost = stats.lost_packets,
        "connection stats"
    );

    conn.close(0u32.into(), b"done");

    // Give the server a fair chance to receive the close packet
    tokio::time::timeout(Duration::from_secs(5), endpoint.wait_idle())
        .await
        .ok();

    Ok(())
}

async fn echo_once(conn: minquic::Connection, size: usize) -> Result<()> {
    let mut payload = vec![0; size];
    rand::thread_rng().fill_bytes(&mut payload);

    let (mut send, mut recv) = conn.open_bi().await?;
    send.write_all(&payload)
        .await
        .context("failed to send request")?;
    send.finish().await.context("failed to finish stream")?;
    let echoed = recv
        .read_to_end(size)
        .await
        .context("failed to read response")?;
    if echoed != payload {
        bail!("stream {} echoed {} bytes that differ", send.id(), echoed.len());
    }
    info!(id = %send.id(), "verified");
    Ok(())
}
