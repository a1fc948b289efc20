//! Line framing for the socket link

use std::sync::Arc;

use eddievent::Event;
use eyre::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Longest frame accepted from a peer
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Parse one received line; blank lines yield `None`
pub fn decode_frame(line: &str) -> Result<Option<Event>> {
    let frame = line.trim_end_matches(['\r', '\n']);
    if frame.trim().is_empty() {
        return Ok(None);
    }
    if frame.len() > MAX_FRAME_SIZE {
        return Err(eyre::eyre!("Frame too large: {} bytes", frame.len()));
    }
    let event = Event::parse_shared(Arc::from(frame)).context("Failed to parse frame")?;
    Ok(Some(event))
}

/// Write one frame followed by a newline
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &str) -> Result<()> {
    writer
        .write_all(frame.as_bytes())
        .await
        .context("Failed to write frame")?;
    writer.write_all(b"\n").await.context("Failed to write newline")?;
    writer.flush().await.context("Failed to flush frame")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_frame() {
        let ev = decode_frame("* ping:&i1::{}\n").unwrap().unwrap();
        assert_eq!(ev.name(), Some("ping"));
        assert!(decode_frame("   \n").unwrap().is_none());
        assert!(decode_frame("not an event").is_err());
    }

    #[test]
    fn test_decode_frame_too_large() {
        let big = format!("* x:\"{}\"::{{}}", "a".repeat(MAX_FRAME_SIZE));
        let err = decode_frame(&big).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_write_frame_appends_newline() {
        let mut buf: Vec<u8> = Vec::new();
        write_frame(&mut buf, "* ping::{}").await.unwrap();
        assert_eq!(buf, b"* ping::{}\n");
    }
}
