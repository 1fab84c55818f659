//! Length-prefixed framing of [`PeerMessage`]s.

use crate::error::{SyncError, SyncResult};
use peersync_protocol::{check_frame_len, PeerMessage};
use std::io::{self, Read, Write};

/// Writes one message as a frame and flushes.
pub fn write_message<W: Write>(writer: &mut W, message: &PeerMessage) -> SyncResult<()> {
    let frame = message.to_frame()?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame and decodes its message.
///
/// A connection closed before the length prefix is reported as a
/// retryable transport error.
pub fn read_message<R: Read>(reader: &mut R) -> SyncResult<PeerMessage> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => SyncError::transport_retryable("connection closed by peer"),
        _ => SyncError::Io(e),
    })?;

    let len = u32::from_be_bytes(len_buf) as usize;
    check_frame_len(len)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(PeerMessage::decode(&body)?)
}
