//! Length-prefixed message framing for async byte streams.
//!
//! Byte streams have no message boundaries and no text/binary
//! distinction, so each frame carries both:
//!
//! ```text
//! [u32 be payload length][u8 kind][payload]
//! ```
//!
//! Kind 0 is a text frame, 1 a binary frame, 2 an explicit close (empty
//! payload). This module works with any `AsyncRead`/`AsyncWrite`:
//! TCP sockets, unix sockets, `tokio::io::duplex` pipes.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this size are rejected on both sides.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bytes of framing overhead per message.
pub const FRAME_HEADER_LEN: usize = 5;

/// The kind byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Text = 0,
    Binary = 1,
    Close = 2,
}

impl FrameKind {
    fn from_byte(byte: u8) -> io::Result<FrameKind> {
        match byte {
            0 => Ok(FrameKind::Text),
            1 => Ok(FrameKind::Binary),
            2 => Ok(FrameKind::Close),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame kind {other}"),
            )),
        }
    }
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end of stream (EOF exactly at a frame
/// boundary); EOF inside a frame is an `UnexpectedEof` error.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<(FrameKind, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eof inside frame header",
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let kind = FrameKind::from_byte(header[4])?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((kind, payload)))
}

/// Write one frame. Does not flush.
pub async fn write_frame<W>(writer: &mut W, kind: FrameKind, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    header[4] = kind as u8;
    writer.write_all(&header).await?;
    writer.write_all(payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trip_all_kinds() {
        let (mut a, mut b) = duplex(1024);
        write_frame(&mut a, FrameKind::Text, b"H1:hi").await.unwrap();
        write_frame(&mut a, FrameKind::Binary, &[0xde, 0xad]).await.unwrap();
        write_frame(&mut a, FrameKind::Close, b"").await.unwrap();

        assert_eq!(
            read_frame(&mut b).await.unwrap(),
            Some((FrameKind::Text, b"H1:hi".to_vec()))
        );
        assert_eq!(
            read_frame(&mut b).await.unwrap(),
            Some((FrameKind::Binary, vec![0xde, 0xad]))
        );
        assert_eq!(
            read_frame(&mut b).await.unwrap(),
            Some((FrameKind::Close, Vec::new()))
        );
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (a, mut b) = duplex(64);
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn eof_inside_header_errors() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn eof_inside_payload_errors() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[0, 0, 0, 9, 0, b'x']).await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let (mut a, mut b) = duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();
        a.write_all(&[0]).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn unknown_kind_rejected() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[0, 0, 0, 0, 9]).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
