//! Initial protocol negotiation.
//!
//! The client opens with `{client_id, protocol_name, version}`; the
//! server answers `{server_id, Answer}`. An unknown protocol or a
//! version mismatch is refused before any protocol body runs.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use walb_core::Result;

use crate::packet::{Answer, Packet, PROTOCOL_VERSION};

/// The client hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Node id of the client.
    pub client_id: String,
    /// Requested protocol.
    pub protocol_name: String,
    /// Client protocol version.
    pub version: u32,
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone)]
pub struct Negotiation {
    /// Node id of the peer.
    pub peer_id: String,
    /// Agreed protocol.
    pub protocol_name: String,
}

/// Run the negotiation as a client.
///
/// # Errors
///
/// Fails when the server refuses the protocol or version.
pub async fn negotiate_client<S: AsyncRead + AsyncWrite + Unpin>(
    pkt: &mut Packet<S>,
    client_id: &str,
    protocol_name: &str,
) -> Result<Negotiation> {
    pkt.write(&Hello {
        client_id: client_id.to_string(),
        protocol_name: protocol_name.to_string(),
        version: PROTOCOL_VERSION,
    })
    .await?;
    pkt.flush().await?;

    let (server_id, answer): (String, Answer) = pkt.read().await?;
    answer.into_result()?;
    Ok(Negotiation { peer_id: server_id, protocol_name: protocol_name.to_string() })
}

/// Run the negotiation as a server.
///
/// `known_protocols` lists what this host serves; anything else is
/// refused with an `Ng` answer and reported as a protocol error.
///
/// # Errors
///
/// Fails on refused negotiation or I/O error.
pub async fn negotiate_server<S: AsyncRead + AsyncWrite + Unpin>(
    pkt: &mut Packet<S>,
    server_id: &str,
    known_protocols: &[&str],
) -> Result<Negotiation> {
    let hello: Hello = pkt.read().await?;

    if hello.version != PROTOCOL_VERSION {
        let msg = format!(
            "version mismatch: client {} server {PROTOCOL_VERSION}",
            hello.version
        );
        pkt.write(&(server_id.to_string(), Answer::Ng { code: 1, msg: msg.clone() })).await?;
        pkt.flush().await?;
        return Err(walb_core::Error::protocol(msg));
    }
    if !known_protocols.contains(&hello.protocol_name.as_str()) {
        let msg = format!("unknown protocol {}", hello.protocol_name);
        pkt.write(&(server_id.to_string(), Answer::Ng { code: 2, msg: msg.clone() })).await?;
        pkt.flush().await?;
        return Err(walb_core::Error::protocol(msg));
    }

    pkt.write(&(server_id.to_string(), Answer::Ok)).await?;
    pkt.flush().await?;
    Ok(Negotiation { peer_id: hello.client_id, protocol_name: hello.protocol_name })
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_negotiation_ok() {
        let (a, b) = duplex(1 << 16);
        let client = tokio::spawn(async move {
            let mut pkt = Packet::new(a);
            negotiate_client(&mut pkt, "storage0", "echo").await
        });
        let mut pkt = Packet::new(b);
        let server = negotiate_server(&mut pkt, "proxy0", &["echo"]).await.unwrap();
        assert_eq!(server.peer_id, "storage0");
        assert_eq!(server.protocol_name, "echo");

        let client = client.await.unwrap().unwrap();
        assert_eq!(client.peer_id, "proxy0");
    }

    #[tokio::test]
    async fn test_unknown_protocol_refused() {
        let (a, b) = duplex(1 << 16);
        let client = tokio::spawn(async move {
            let mut pkt = Packet::new(a);
            negotiate_client(&mut pkt, "storage0", "no-such-protocol").await
        });
        let mut pkt = Packet::new(b);
        assert!(negotiate_server(&mut pkt, "proxy0", &["echo"]).await.is_err());
        assert!(client.await.unwrap().is_err());
    }
}
