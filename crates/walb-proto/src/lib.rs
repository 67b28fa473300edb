//! Wire protocols of the WalB hosts.
//!
//! Every connection starts with the same negotiation
//! (`{client_id, protocol_name, version}` → `{server_id, answer}`),
//! then runs one protocol:
//! - `echo`: connectivity check
//! - `get-host-type`: used by the proxy heartbeat
//! - `wlog-transfer`: stream converted diff packs to a proxy
//! - `dirty-full-sync` / `dirty-hash-sync`: establish an archive base

#![warn(missing_docs)]

pub mod compressed;
pub mod echo;
pub mod full_sync;
pub mod hash_sync;
pub mod host_type;
pub mod negotiation;
pub mod packet;
pub mod wlog;

pub use compressed::CompressedData;
pub use negotiation::{negotiate_client, negotiate_server, Negotiation};
pub use packet::{Answer, Packet, PROTOCOL_VERSION};
pub use wlog::{WlogReceiver, WlogSender, WlogTransferParams};

/// Protocol name: echo.
pub const ECHO_PROTOCOL: &str = "echo";
/// Protocol name: host-type query.
pub const GET_HOST_TYPE_PROTOCOL: &str = "get-host-type";
/// Protocol name: wlog transfer.
pub const WLOG_TRANSFER_PROTOCOL: &str = "wlog-transfer";
/// Protocol name: dirty full sync.
pub const DIRTY_FULL_SYNC_PROTOCOL: &str = "dirty-full-sync";
/// Protocol name: dirty hash sync.
pub const DIRTY_HASH_SYNC_PROTOCOL: &str = "dirty-hash-sync";

/// Host type string of a storage host.
pub const HOST_TYPE_STORAGE: &str = "storage";
/// Host type string of a proxy host.
pub const HOST_TYPE_PROXY: &str = "proxy";
/// Host type string of an archive host.
pub const HOST_TYPE_ARCHIVE: &str = "archive";

/// Accept message exchanged after protocol-specific handshakes.
pub const MSG_ACCEPT: &str = "accept";
