//! Line framing and write helpers shared by both session types.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Framing and I/O failures become `SessionError` and end the session
//! - Bytes that are not UTF-8 never fail a read; they decode lossily

use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};

/// Write timeout (10 seconds)
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Newline-delimited byte reader. `\r\n` endings are accepted.
pub type LineReader<R> = FramedRead<R, AnyDelimiterCodec>;

pub(crate) fn line_reader<R: AsyncRead>(reader: R, max_length: usize) -> LineReader<R> {
    FramedRead::new(
        reader,
        AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_length),
    )
}

/// Reads the next line; `Ok(None)` at end of stream.
///
/// Invalid UTF-8 is replaced with U+FFFD rather than failing, so a garbled
/// line reaches the protocol parser like any other malformed input.
pub(crate) async fn next_line<R>(lines: &mut LineReader<R>) -> Result<Option<String>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let max = lines.decoder().max_length();
    match lines.next().await {
        None => Ok(None),
        Some(Ok(chunk)) => {
            let bytes = chunk.strip_suffix(b"\r").unwrap_or(&chunk[..]);
            Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
        }
        Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
            Err(SessionError::LineTooLong { max })
        }
        Some(Err(AnyDelimiterCodecError::Io(e))) => Err(SessionError::Io(e.to_string())),
    }
}

/// Writes `text` and flushes, bounded by [`WRITE_TIMEOUT`].
pub(crate) async fn write_text<W>(writer: &mut W, text: &str) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(text.as_bytes()).await?;
        writer.flush().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SessionError::Io(e.to_string())),
        Err(_) => Err(SessionError::WriteTimeout),
    }
}

/// Errors that end a single session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Line too long (max: {max} bytes)")]
    LineTooLong { max: usize },

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_next_line_strips_terminators() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"first\r\nsecond\nlast").await.unwrap();
        drop(client);

        let mut lines = line_reader(server, 64);
        assert_eq!(next_line(&mut lines).await.unwrap().as_deref(), Some("first"));
        assert_eq!(next_line(&mut lines).await.unwrap().as_deref(), Some("second"));
        assert_eq!(next_line(&mut lines).await.unwrap().as_deref(), Some("last"));
        assert_eq!(next_line(&mut lines).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_next_line_decodes_invalid_utf8_lossily() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"caf\xe9\r\nnext\n").await.unwrap();
        drop(client);

        let mut lines = line_reader(server, 64);
        assert_eq!(next_line(&mut lines).await.unwrap().as_deref(), Some("caf\u{FFFD}"));
        assert_eq!(next_line(&mut lines).await.unwrap().as_deref(), Some("next"));
        assert_eq!(next_line(&mut lines).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_next_line_rejects_long_lines() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(&[b'x'; 100]).await.unwrap();
        client.write_all(b"\n").await.unwrap();

        let mut lines = line_reader(server, 16);
        let err = next_line(&mut lines).await.unwrap_err();
        assert!(matches!(err, SessionError::LineTooLong { max: 16 }));
    }

    #[tokio::test]
    async fn test_write_text_flushes() {
        let (mut client, mut server) = tokio::io::duplex(256);
        write_text(&mut server, "1 2 .\r\n").await.unwrap();
        drop(server);

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "1 2 .\r\n");
    }

    #[test]
    fn test_session_error_display() {
        assert_eq!(SessionError::Timeout.to_string(), "Read timeout");
        assert!(SessionError::Io("broken pipe".to_string())
            .to_string()
            .contains("broken pipe"));
    }
}
