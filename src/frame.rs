//! Length-prefixed framing, as used by Thrift's framed transport.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of
//! payload.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Size of the length prefix.
pub const HEADER_SIZE: usize = 4;

/// Largest payload accepted unless configured otherwise (32 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended after a frame had started.
    #[error("connection closed in the middle of a frame")]
    Truncated,
    #[error("frame of {0} bytes exceeds the limit of {1} bytes")]
    TooLarge(usize, usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reads one frame.
///
/// Returns `Ok(None)` if the stream is closed before the first byte of the
/// length prefix, which is how a client ends a session.
///
/// # Errors
///
/// Returns [`FrameError::Truncated`] if the stream closes mid-frame, and
/// [`FrameError::TooLarge`] if the declared length exceeds `max_size`.
pub fn read_frame<R: Read>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0_u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(FrameError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_size {
        return Err(FrameError::TooLarge(len, max_size));
    }
    let mut payload = vec![0; len];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;
    Ok(Some(payload))
}

/// Writes `payload` as a single frame and flushes the writer.
///
/// The prefix and payload go out in one `write_all` call.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] if the payload does not fit in a 32-bit
/// length, or an I/O error from the writer.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| FrameError::TooLarge(payload.len(), u32::MAX as usize))?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{read_frame, write_frame, FrameError};

    #[test]
    fn two_frames_then_eof() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first").unwrap();
        write_frame(&mut wire, b"").unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 5]);

        let mut reader = wire.as_slice();
        assert_eq!(read_frame(&mut reader, 16).unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut reader, 16).unwrap().unwrap(), b"");
        assert!(read_frame(&mut reader, 16).unwrap().is_none());
    }

    #[test]
    fn truncated_prefix() {
        let mut reader: &[u8] = &[0, 0];
        assert!(matches!(
            read_frame(&mut reader, 16),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn truncated_payload() {
        let mut reader: &[u8] = &[0, 0, 0, 8, b'a', b'b'];
        assert!(matches!(
            read_frame(&mut reader, 16),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn oversized_frame_is_refused_before_allocation() {
        let mut reader: &[u8] = &[0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            read_frame(&mut reader, 1024),
            Err(FrameError::TooLarge(0xffff_ffff, 1024))
        ));
    }
}
