//! Packet-level I/O on a bare byte stream.
//!
//! Lets a test play one side of the protocol by hand, e.g. an acceptor
//! that answers the handshake and then freezes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use palaver_core::packet::{Packet, PacketHeader, HEADER_LEN};
use palaver_core::Error;

pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, Error>
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
    Packet::decode(header, &payload)
}

pub async fn write_packet<W>(writer: &mut W, pkt: &Packet) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&pkt.encode()?).await?;
    writer.flush().await?;
    Ok(())
}
