//! Control-protocol client used by the CLI commands.

use std::net::SocketAddr;

use anyhow::{bail, Context};
use tokio::net::TcpStream;
use walb_proto::{negotiate_client, Answer, Packet};

/// Run one control command and return the server's result lines.
pub async fn run_command(
    addr: SocketAddr,
    client_id: &str,
    command: &str,
    params: Vec<String>,
) -> anyhow::Result<Vec<String>> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let mut pkt = Packet::new(stream);
    negotiate_client(&mut pkt, client_id, command)
        .await
        .with_context(|| format!("negotiation for {command} failed"))?;

    pkt.write(&params).await?;
    pkt.flush().await?;

    let (answer, lines): (Answer, Vec<String>) = pkt.read().await?;
    match answer {
        Answer::Ok => Ok(lines),
        Answer::Ng { code, msg } => bail!("{command} failed (code {code}): {msg}"),
    }
}
