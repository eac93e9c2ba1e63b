//! Framed packet I/O over a byte stream.
//!
//! The header's length field is the single source of truth: read exactly
//! one header, then exactly `payload_len` bytes, then hand both to the
//! typed decoder.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use palaver_core::packet::{Packet, PacketHeader, HEADER_LEN};
use palaver_core::Error;

/// Read one frame: the header plus exactly the declared payload bytes.
///
/// Errors here mean the byte stream itself can no longer be trusted
/// (I/O failure, bad version, implausible length); a payload that later
/// fails its typed decode leaves framing intact.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<(PacketHeader, Vec<u8>), Error>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HEADER_LEN];
    reader.read_exact(&mut hdr).await?;
    let header = PacketHeader::decode(&hdr)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }
    Ok((header, payload))
}

pub(crate) async fn read_packet<R>(reader: &mut R) -> Result<Packet, Error>
where
    R: AsyncRead + Unpin,
{
    let (header, payload) = read_frame(reader).await?;
    Packet::decode(header, &payload)
}

pub(crate) async fn write_packet<W>(writer: &mut W, pkt: &Packet) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let bytes = pkt.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
