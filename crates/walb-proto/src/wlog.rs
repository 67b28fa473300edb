//! Wlog transfer protocol.
//!
//! The storage host converts logpack records into diff packs on the
//! fly, compresses them through the converter queue, and streams them
//! to a proxy as snappy frames. The stream ends with an empty pack,
//! followed by the `MetaDiff` and an acknowledgement (driven by the
//! caller).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use walb_core::{Error, Result, LOGICAL_BLOCK_SIZE, UUID_SIZE};
use walb_diff::{
    CompressionType, ConverterMode, ConverterQueue, DiffPack, DiffRecord, DIFF_PACK_SIZE,
};
use walb_logdev::pack::Parsed;
use walb_logdev::{LogPackHeader, WlogFileHeader};

use crate::compressed::CompressedData;
use crate::packet::Packet;
use crate::MSG_ACCEPT;

/// Handshake payload of `wlog-transfer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WlogTransferParams {
    /// Volume being transferred.
    pub vol_id: String,
    /// Device uuid.
    pub uuid: [u8; UUID_SIZE],
    /// Physical block size of the log device.
    pub pbs: u32,
    /// Log checksum salt.
    pub salt: u32,
    /// Volume size [lb].
    pub vol_size_lb: u64,
    /// Upper bound of the log range this round [pb].
    pub max_log_size_pb: u64,
}

/// In-flight bound of the sender's converter queue.
const CONVERTER_QUEUE_LEN: usize = 4;

/// Parallel compression engines per transfer.
const CONVERTER_ENGINES: usize = 2;

/// Streaming sender: logpack records in, compressed diff packs out.
pub struct WlogSender<S> {
    pkt: Packet<S>,
    pbs: u32,
    salt: u32,
    queue: ConverterQueue,
    in_flight: usize,
    pack: DiffPack,
    data: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WlogSender<S> {
    /// Wrap a negotiated, accepted connection.
    #[must_use]
    pub fn new(pkt: Packet<S>, pbs: u32, salt: u32, compression: CompressionType) -> Self {
        Self {
            pkt,
            pbs,
            salt,
            queue: ConverterQueue::new(
                CONVERTER_QUEUE_LEN,
                CONVERTER_ENGINES,
                ConverterMode::Compress { ty: compression, level: 0 },
            ),
            in_flight: 0,
            pack: DiffPack::new(),
            data: Vec::new(),
        }
    }

    /// Open the stream with its wlog file header naming the lsid range
    /// about to be shipped.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn send_preamble(
        &mut self,
        uuid: [u8; UUID_SIZE],
        begin_lsid: u64,
        end_lsid: u64,
    ) -> Result<()> {
        let header = WlogFileHeader::new(self.pbs, self.salt, uuid, begin_lsid, end_lsid);
        self.pkt.write_buf(&header.to_block()).await
    }

    /// Validate a logpack header against the negotiated device
    /// parameters.
    ///
    /// # Errors
    ///
    /// Fails on pbs or salt mismatch.
    pub fn push_header(&mut self, header: &LogPackHeader) -> Result<()> {
        if header.pbs() != self.pbs || header.salt() != self.salt {
            return Err(Error::protocol(format!(
                "logpack device parameters changed: pbs {} salt {:#x}",
                header.pbs(),
                header.salt()
            )));
        }
        Ok(())
    }

    /// Translate record `idx` of `header` into a diff record and queue
    /// it. `blocks` is the pb-rounded IO data for records that carry
    /// data, `None` otherwise.
    ///
    /// # Errors
    ///
    /// Fails on data/flags mismatch or a transport error.
    pub async fn push_io(
        &mut self,
        header: &LogPackHeader,
        idx: usize,
        blocks: Option<&[u8]>,
    ) -> Result<()> {
        let log_rec = header.record(idx);
        if log_rec.flags.is_padding() {
            return Ok(());
        }
        if log_rec.flags.is_discard() {
            let rec = DiffRecord::discard(log_rec.offset, log_rec.io_size);
            return self.add_to_pack(rec, &[]).await;
        }
        let blocks = blocks.ok_or_else(|| Error::protocol("normal log record without data"))?;
        let io_bytes = log_rec.io_size as usize * LOGICAL_BLOCK_SIZE;
        if blocks.len() < io_bytes {
            return Err(Error::protocol(format!(
                "log IO data {} shorter than io_size {}",
                blocks.len(),
                io_bytes
            )));
        }
        let raw = &blocks[..io_bytes];
        let mut rec = DiffRecord::normal(log_rec.offset, log_rec.io_size);
        rec.data_size = raw.len() as u32;
        rec.checksum = walb_core::checksum(raw, 0);
        self.add_to_pack(rec, raw).await
    }

    async fn add_to_pack(&mut self, rec: DiffRecord, raw: &[u8]) -> Result<()> {
        if self.pack.is_full_for(rec.data_size) {
            self.seal_pack().await?;
        }
        self.pack.add(rec).ok_or_else(|| Error::protocol("record exceeds empty pack limits"))?;
        self.data.extend_from_slice(raw);
        Ok(())
    }

    async fn seal_pack(&mut self) -> Result<()> {
        if self.pack.is_end() {
            return Ok(());
        }
        let mut bytes = self.pack.to_block();
        bytes.append(&mut self.data);
        self.pack = DiffPack::new();

        if self.in_flight >= CONVERTER_QUEUE_LEN {
            self.forward_one().await?;
        }
        self.queue.push(bytes).await?;
        self.in_flight += 1;
        Ok(())
    }

    async fn forward_one(&mut self) -> Result<()> {
        let converted = self
            .queue
            .pop()
            .await?
            .ok_or_else(|| Error::protocol("converter queue drained early"))?;
        self.in_flight -= 1;
        CompressedData::from_raw(&converted)?.send(&mut self.pkt).await
    }

    /// Flush everything and emit the terminating empty pack.
    ///
    /// # Errors
    ///
    /// Fails on converter or transport errors.
    pub async fn sync(&mut self) -> Result<()> {
        self.seal_pack().await?;
        while self.in_flight > 0 {
            self.forward_one().await?;
        }
        let end = DiffPack::new().to_block();
        CompressedData::from_raw(&end)?.send(&mut self.pkt).await?;
        self.pkt.flush().await
    }

    /// Hand the packet stream back for the MetaDiff + Ack tail.
    #[must_use]
    pub fn into_packet(mut self) -> Packet<S> {
        self.queue.quit();
        self.pkt
    }
}

/// Receiving half of `wlog-transfer` (proxy surface).
pub struct WlogReceiver<S> {
    pkt: Packet<S>,
    done: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WlogReceiver<S> {
    /// Read the handshake parameters from a negotiated connection.
    ///
    /// # Errors
    ///
    /// Returns decode or I/O errors.
    pub async fn handshake(mut pkt: Packet<S>) -> Result<(Self, WlogTransferParams)> {
        let params: WlogTransferParams = pkt.read().await?;
        Ok((Self { pkt, done: false }, params))
    }

    /// Accept the transfer.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn accept(&mut self) -> Result<()> {
        self.pkt.write(&MSG_ACCEPT.to_string()).await?;
        self.pkt.flush().await
    }

    /// Refuse the transfer with a reason.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn reject(&mut self, reason: &str) -> Result<()> {
        self.pkt.write(&reason.to_string()).await?;
        self.pkt.flush().await
    }

    /// Read and validate the stream preamble.
    ///
    /// # Errors
    ///
    /// Fails on a corrupt wlog file header.
    pub async fn recv_preamble(&mut self) -> Result<WlogFileHeader> {
        let block = self.pkt.read_buf().await?;
        match WlogFileHeader::parse(&block) {
            Parsed::Valid(h) => Ok(h),
            Parsed::Shrunken(_) | Parsed::Invalid(_) => {
                Err(Error::protocol("invalid wlog stream preamble"))
            }
        }
    }

    /// Receive the next pack, or `None` after the terminator.
    ///
    /// # Errors
    ///
    /// Fails on corrupt frames or packs.
    pub async fn recv_pack(&mut self) -> Result<Option<(DiffPack, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        let raw = CompressedData::recv(&mut self.pkt).await?.into_raw()?;
        if raw.len() < DIFF_PACK_SIZE {
            return Err(Error::protocol("pack frame shorter than a pack header"));
        }
        let pack = DiffPack::parse(&raw[..DIFF_PACK_SIZE])?;
        if pack.is_end() {
            self.done = true;
            return Ok(None);
        }
        let data = raw[DIFF_PACK_SIZE..].to_vec();
        if data.len() != pack.total_size() as usize {
            return Err(Error::protocol("pack data length mismatch"));
        }
        Ok(Some((pack, data)))
    }

    /// Read the trailing `MetaDiff` and acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns decode or I/O errors.
    pub async fn finish(mut self) -> Result<walb_core::MetaDiff> {
        let diff: walb_core::MetaDiff = self.pkt.read().await?;
        self.pkt.send_ack().await?;
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;
    use walb_core::MetaDiff;
    use walb_diff::compress::uncompress_record;

    use super::*;

    const PBS: u32 = 4096;
    const SALT: u32 = 0x11223344;

    #[tokio::test]
    async fn test_transfer_stream() {
        let (a, b) = duplex(1 << 20);

        let sender_task = tokio::spawn(async move {
            let pkt = Packet::new(a);
            let mut sender = WlogSender::new(pkt, PBS, SALT, CompressionType::Snappy);

            let mut header = LogPackHeader::new(PBS, SALT, 0);
            assert!(header.add_normal_io(0, 8).unwrap());
            assert!(header.add_discard_io(100, 16).unwrap());
            let io = vec![0x77u8; 4096];

            sender.send_preamble([9; 16], 0, 2).await.unwrap();
            sender.push_header(&header).unwrap();
            sender.push_io(&header, 0, Some(&io)).await.unwrap();
            sender.push_io(&header, 1, None).await.unwrap();
            sender.sync().await.unwrap();

            let mut pkt = sender.into_packet();
            pkt.write(&MetaDiff::new(0, 1, true, 12345)).await.unwrap();
            pkt.flush().await.unwrap();
            pkt.recv_ack().await.unwrap();
        });

        // No handshake params in this test; start past that stage.
        let mut receiver = WlogReceiver { pkt: Packet::new(b), done: false };
        let preamble = receiver.recv_preamble().await.unwrap();
        assert_eq!(preamble.begin_lsid, 0);
        assert_eq!(preamble.end_lsid, 2);
        assert_eq!(preamble.log_checksum_salt, SALT);

        let mut records = Vec::new();
        while let Some((pack, data)) = receiver.recv_pack().await.unwrap() {
            for rec in pack.records() {
                let io = if rec.has_data() {
                    let begin = rec.data_offset as usize;
                    let stored = &data[begin..begin + rec.data_size as usize];
                    Some(uncompress_record(rec, stored).unwrap())
                } else {
                    None
                };
                records.push((*rec, io));
            }
        }
        let diff = receiver.finish().await.unwrap();
        sender_task.await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0.io_address, 0);
        assert_eq!(records[0].0.io_blocks, 8);
        assert_eq!(records[0].1.as_deref().unwrap(), &[0x77u8; 4096][..]);
        assert!(records[1].0.flags.is_discard());
        assert_eq!(records[1].0.io_blocks, 16);
        assert_eq!(diff, MetaDiff::new(0, 1, true, 12345));
    }

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let (a, b) = duplex(1 << 16);
        let params = WlogTransferParams {
            vol_id: "vol0".to_string(),
            uuid: [5; 16],
            pbs: PBS,
            salt: SALT,
            vol_size_lb: 1 << 21,
            max_log_size_pb: 1024,
        };
        let sent = params.clone();
        let client = tokio::spawn(async move {
            let mut pkt = Packet::new(a);
            pkt.write(&sent).await.unwrap();
            pkt.flush().await.unwrap();
            let res: String = pkt.read().await.unwrap();
            assert_eq!(res, MSG_ACCEPT);
        });

        let (mut receiver, got) = WlogReceiver::handshake(Packet::new(b)).await.unwrap();
        assert_eq!(got, params);
        receiver.accept().await.unwrap();
        client.await.unwrap();
    }
}
