//! Socket transport layer - newline-delimited JSON over a Unix domain socket

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use super::error::EmbeddingError;

/// One request/response connection to the embedding server
pub struct SocketTransport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SocketTransport {
    /// Connect, failing with `TIMEOUT` if the accept takes longer than `timeout`
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self, EmbeddingError> {
        let stream = match tokio::time::timeout(timeout, UnixStream::connect(path)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EmbeddingError::timeout(format!(
                    "connect to {} timed out after {:?}",
                    path.display(),
                    timeout
                )))
            }
        };

        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    /// Write one frame (the caller supplies the trailing newline)
    pub async fn send(&mut self, line: &str) -> Result<(), EmbeddingError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the next non-empty line.
    ///
    /// Partial lines are accumulated until a newline arrives. If the server
    /// closes the connection after a final unterminated line, that line is
    /// still returned; a close with nothing buffered is `SOCKET_CLOSED`.
    pub async fn receive(&mut self) -> Result<String, EmbeddingError> {
        loop {
            let mut line = String::new();
            let bytes_read = self.reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Err(EmbeddingError::closed("embedding server closed connection"));
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(trimmed.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingErrorKind;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_partial_lines_are_joined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"\n{\"embed").await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            stream.write_all(b"ding\":[1.0]}\n").await.unwrap();
            stream.write_all(b"{\"tail\":true}").await.unwrap();
        });

        let mut transport = SocketTransport::connect(&path, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(transport.receive().await.unwrap(), "{\"embedding\":[1.0]}");
        server.await.unwrap();
        assert_eq!(transport.receive().await.unwrap(), "{\"tail\":true}");
        let err = transport.receive().await.unwrap_err();
        assert_eq!(err.kind, EmbeddingErrorKind::SocketClosed);
    }

    #[tokio::test]
    async fn test_missing_socket_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = SocketTransport::connect(&dir.path().join("none.sock"), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, EmbeddingErrorKind::SocketNotFound);
    }
}
