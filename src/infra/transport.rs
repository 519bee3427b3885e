//! Header Framing Transport
//!
//! `Content-Length` framing shared by both dialects:
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! {"jsonrpc":"2.0",...}
//! ```
//! Any framing defect is fatal; the stream cannot be resynchronized.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::FramingError;

const CONTENT_LENGTH: &str = "Content-Length";

/// Largest payload accepted from a peer
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// Upfront buffer reservation; larger bodies grow as bytes arrive
const INITIAL_BODY_CAPACITY: usize = 64 * 1024;

/// Reads framed payloads from a byte stream
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Read the next payload. `Ok(None)` means the peer closed the stream
    /// cleanly between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_CONTENT_LENGTH {
            return Err(FramingError::TooLarge {
                length: content_length,
                limit: MAX_CONTENT_LENGTH,
            });
        }

        let mut body = Vec::with_capacity(content_length.min(INITIAL_BODY_CAPACITY));
        (&mut self.reader)
            .take(content_length as u64)
            .read_to_end(&mut body)
            .await?;
        if body.len() < content_length {
            return Err(FramingError::Truncated {
                expected: content_length,
            });
        }

        tracing::trace!("<- {}", String::from_utf8_lossy(&body));
        Ok(Some(body))
    }

    /// Read one header block and return its Content-Length
    async fn read_headers(&mut self) -> Result<Option<usize>, FramingError> {
        let mut content_length: Option<usize> = None;
        let mut seen_header = false;

        loop {
            self.line.clear();
            let bytes_read = self.reader.read_line(&mut self.line).await?;

            if bytes_read == 0 {
                return if seen_header {
                    Err(FramingError::UnexpectedEof)
                } else {
                    Ok(None)
                };
            }

            let line = self.line.trim();

            if line.is_empty() {
                // Stray separators between frames
                if !seen_header {
                    continue;
                }
                break;
            }
            seen_header = true;

            let Some((name, value)) = line.split_once(':') else {
                return Err(FramingError::InvalidHeader(line.to_string()));
            };

            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                let value = value.trim();
                content_length = Some(
                    value
                        .parse()
                        .map_err(|_| FramingError::InvalidContentLength(value.to_string()))?,
                );
            }
            // Content-Type and friends are ignored
        }

        content_length
            .map(Some)
            .ok_or(FramingError::MissingContentLength)
    }
}

/// Frame a payload with its Content-Length header
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", payload.len());
    let mut framed = Vec::with_capacity(header.len() + payload.len());
    framed.extend_from_slice(header.as_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Write one framed payload and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    tracing::trace!("-> {}", String::from_utf8_lossy(payload));

    writer.write_all(&frame(payload)).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;

    #[test]
    fn test_message_framing() {
        let json = r#"{"jsonrpc":"2.0","id":1,"method":"test"}"#;
        let framed = frame(json.as_bytes());
        assert!(framed.starts_with(b"Content-Length: 40\r\n\r\n"));
        assert!(framed.ends_with(json.as_bytes()));
    }

    #[tokio::test]
    async fn test_frame_then_read_returns_payload() {
        let payload = r#"{"a":"é","b":[1,2,3]}"#.as_bytes();
        let framed = frame(payload);
        assert!(framed.starts_with(b"Content-Length: 22\r\n\r\n"));
        let mut reader = FrameReader::new(&framed[..]);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), payload);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_across_chunks_and_extra_headers() {
        let mock = Builder::new()
            .read(b"Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-len")
            .read(b"gth: 2\r\n\r\n{")
            .read(b"}Content-Length: 4\r\n\r\nnull")
            .build();
        let mut reader = FrameReader::new(mock);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"{}");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"null");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_content_length_is_fatal() {
        let mut reader = FrameReader::new(&b"Content-Type: x\r\n\r\n{}"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(FramingError::MissingContentLength)
        ));
    }

    #[tokio::test]
    async fn test_invalid_content_length_is_fatal() {
        let mut reader = FrameReader::new(&b"Content-Length: ten\r\n\r\n{}"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(FramingError::InvalidContentLength(v)) if v == "ten"
        ));

        let mut reader = FrameReader::new(&b"garbage\r\n\r\n"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(FramingError::InvalidHeader(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_content_length_is_fatal() {
        let mut reader =
            FrameReader::new(&b"Content-Length: 18446744073709551615\r\n\r\n{}"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(FramingError::TooLarge { limit: MAX_CONTENT_LENGTH, .. })
        ));

        let header = format!("Content-Length: {}\r\n\r\n{{}}", MAX_CONTENT_LENGTH + 1);
        let mut reader = FrameReader::new(header.as_bytes());
        assert!(matches!(
            reader.read_frame().await,
            Err(FramingError::TooLarge { length, .. }) if length == MAX_CONTENT_LENGTH + 1
        ));

        // Out of usize range entirely
        let mut reader =
            FrameReader::new(&b"Content-Length: 99999999999999999999999\r\n\r\n"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(FramingError::InvalidContentLength(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let mut reader = FrameReader::new(&b"Content-Length: 10\r\n\r\n{}"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(FramingError::Truncated { expected: 10 })
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_headers() {
        let mut reader = FrameReader::new(&b"Content-Length: 2\r\n"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(FramingError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_write_frame_flushes_exact_bytes() {
        let mut mock = Builder::new().write(b"Content-Length: 2\r\n\r\n{}").build();
        write_frame(&mut mock, b"{}").await.unwrap();
    }
}
