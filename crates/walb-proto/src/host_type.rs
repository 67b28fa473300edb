//! Host-type query, used by the proxy heartbeat.

use tokio::io::{AsyncRead, AsyncWrite};
use walb_core::Result;

use crate::negotiation::{negotiate_client, negotiate_server};
use crate::packet::Packet;
use crate::GET_HOST_TYPE_PROTOCOL;

/// Negotiate `get-host-type` and return the peer's host type string.
///
/// # Errors
///
/// Fails on refused negotiation or I/O error.
pub async fn get_host_type_client<S: AsyncRead + AsyncWrite + Unpin>(
    pkt: &mut Packet<S>,
    client_id: &str,
) -> Result<String> {
    negotiate_client(pkt, client_id, GET_HOST_TYPE_PROTOCOL).await?;
    pkt.read().await
}

/// Serve one `get-host-type` request (negotiation included).
///
/// # Errors
///
/// Fails on refused negotiation or I/O error.
pub async fn get_host_type_server<S: AsyncRead + AsyncWrite + Unpin>(
    pkt: &mut Packet<S>,
    server_id: &str,
    host_type: &str,
) -> Result<()> {
    negotiate_server(pkt, server_id, &[GET_HOST_TYPE_PROTOCOL]).await?;
    pkt.write(&host_type.to_string()).await?;
    pkt.flush().await
}

/// Answer a host-type body after negotiation already happened.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub async fn send_host_type<S: AsyncRead + AsyncWrite + Unpin>(
    pkt: &mut Packet<S>,
    host_type: &str,
) -> Result<()> {
    pkt.write(&host_type.to_string()).await?;
    pkt.flush().await
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::HOST_TYPE_PROXY;

    #[tokio::test]
    async fn test_host_type() {
        let (a, b) = duplex(1 << 16);
        let server = tokio::spawn(async move {
            let mut pkt = Packet::new(b);
            get_host_type_server(&mut pkt, "proxy0", HOST_TYPE_PROXY).await
        });
        let mut pkt = Packet::new(a);
        let ty = get_host_type_client(&mut pkt, "storage0").await.unwrap();
        assert_eq!(ty, HOST_TYPE_PROXY);
        server.await.unwrap().unwrap();
    }
}
