//! Echo server: every bidirectional stream is read to its end and written back.
//!
//! Run with `RUST_LOG=info cargo run --example server -- --psk secret`.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use minquic::{EndpointConfig, ServerConfig};
use tracing::{error, info, info_span, Instrument as _};

#[derive(Parser, Debug)]
#[clap(name = "server")]
struct Opt {
    /// Address to listen on
    #[clap(long = "listen", default_value = "[::1]:4433")]
    listen: SocketAddr,
    /// Pre-shared key both sides derive packet protection from
    #[clap(long = "psk", default_value = "minquic")]
    psk: String,
    /// Maximum number of concurrent connections to allow
    #[clap(long = "connection-limit")]
    connection_limit: Option<usize>,
    /// Largest stream to echo, in bytes
    #[clap(long = "max-stream", default_value = "67108864")]
    max_stream: usize,
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
    let mut endpoint_config = EndpointConfig::default();
    if let Some(limit) = options.connection_limit {
        endpoint_config.max_concurrent_connections(limit);
    }
    let server_config = ServerConfig::with_psk(options.psk.as_bytes());

    let socket = std::net::UdpSocket::bind(options.listen)
        .with_context(|| format!("failed to bind {}", options.listen))?;
    let endpoint = minquic::Endpoint::new(endpoint_config, Some(server_config), socket)?;
    eprintln!("listening on {}", endpoint.local_addr()?);

    while let Some(connecting) = endpoint.accept().await {
        info!(remote = %connecting.remote_address(), "connection incoming");
        let fut = handle_connection(connecting, options.max_stream);
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                error!("connection failed: {reason}", reason = e.to_string())
            }
        });
    }

    Ok(())
}

async fn handle_connection(conn: minquic::Connecting, max_stream: usize) -> Result<()> {
    let connection = conn.await?;
    let span = info_span!("connection", remote = %connection.remote_address());
    async {
        info!("established");

        loop {
            let stream = connection.accept_bi().await;
            let stream = match stream {
                Err(minquic::StreamError::ConnectionLost(
                    minquic::ConnectionError::ApplicationClosed { .. },
                )) => {
                    info!("connection closed");
                    return Ok(());
                }
                Err(e) => {
                    return Err(e.into());
                }
                Ok(s) => s,
            };
            let fut = echo(stream, max_stream);
            tokio::spawn(
                async move {
                    if let Err(e) = fut.await {
                        error!("failed: {reason}", reason = e.to_string());
                    }
                }
                .instrument(info_span!("echo")),
            );
        }
    }
    .instrument(span)
    .await
}

async fn echo(
    (mut send, mut recv): (minquic::SendStream, minquic::RecvStream),
    max_stream: usize,
) -> Result<()> {
    let data = recv
        .read_to_end(max_stream)
        .await
        .context("failed reading stream")?;
    info!(id = %send.id(), len = data.len(), "echoing");
    send.write_all(&data)
        .await
        .context("failed to send response")?;
    send.finish().await.context("failed to finish stream")?;
    info!("complete");
    Ok(())
}
