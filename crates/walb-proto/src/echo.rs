//! Echo protocol: count, then count strings round-tripped verbatim.

use tokio::io::{AsyncRead, AsyncWrite};
use walb_core::{Error, Result};

use crate::packet::Packet;

/// Run echo as a client, verifying every echoed string.
///
/// # Errors
///
/// Fails when the peer echoes a different string or on I/O error.
pub async fn echo_client<S: AsyncRead + AsyncWrite + Unpin>(
    pkt: &mut Packet<S>,
    messages: &[String],
) -> Result<()> {
    if messages.is_empty() {
        return Err(Error::protocol("echo requires at least one message"));
    }
    pkt.write(&(messages.len() as u32)).await?;
    for msg in messages {
        pkt.write(msg).await?;
        pkt.flush().await?;
        let back: String = pkt.read().await?;
        if &back != msg {
            return Err(Error::protocol(format!("echo mismatch: sent {msg:?} got {back:?}")));
        }
    }
    Ok(())
}

/// Run echo as a server.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub async fn echo_server<S: AsyncRead + AsyncWrite + Unpin>(pkt: &mut Packet<S>) -> Result<()> {
    let count: u32 = pkt.read().await?;
    for _ in 0..count {
        let msg: String = pkt.read().await?;
        pkt.write(&msg).await?;
        pkt.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_echo() {
        let (a, b) = duplex(1 << 16);
        let server = tokio::spawn(async move {
            let mut pkt = Packet::new(b);
            echo_server(&mut pkt).await
        });
        let mut pkt = Packet::new(a);
        echo_client(&mut pkt, &["hello".to_string(), "world".to_string()]).await.unwrap();
        server.await.unwrap().unwrap();
    }
}
