//! Newline-framed duplex text channel.
//!
//! No protocol knowledge: lines in, lines out. The read and write halves are
//! split so one task can block on [`LineReader::read_line`] while others
//! write. Closing (from any task or thread) unblocks a pending read.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{CliError, CliResult};

/// Handle that closes a channel; cheap to clone and idempotent.
#[derive(Debug, Clone, Default)]
pub struct ChannelCloser {
    token: CancellationToken,
}

impl ChannelCloser {
    pub fn close(&self) {
        if !self.token.is_cancelled() {
            trace!("closing line channel");
            self.token.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the channel has been closed.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// Line-oriented channel over any byte stream.
pub struct LineChannel<R, W> {
    reader: LineReader<R>,
    writer: LineWriter<W>,
}

impl LineChannel<OwnedReadHalf, OwnedWriteHalf> {
    /// Open a TCP channel, failing with `ConnectFailed` if the transport
    /// cannot be established within `connect_timeout`.
    pub async fn open(address: &str, connect_timeout: Duration) -> CliResult<Self> {
        debug!(address, "opening line channel");
        let stream = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| CliError::ConnectFailed {
                address: address.to_string(),
                reason: format!("timed out after {:?}", connect_timeout),
            })?
            .map_err(|e| CliError::ConnectFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(address, "could not set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_parts(read_half, write_half))
    }
}

impl<R, W> LineChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wrap an already-open stream pair.
    pub fn from_parts(read_half: R, write_half: W) -> Self {
        let closer = ChannelCloser::default();
        Self {
            reader: LineReader {
                inner: BufReader::new(read_half),
                closer: closer.clone(),
                buf: Vec::new(),
            },
            writer: LineWriter {
                inner: write_half,
                closer,
            },
        }
    }

    pub fn closer(&self) -> ChannelCloser {
        self.reader.closer.clone()
    }

    pub fn into_split(self) -> (LineReader<R>, LineWriter<W>) {
        (self.reader, self.writer)
    }
}

/// Read half of a [`LineChannel`].
pub struct LineReader<R> {
    inner: BufReader<R>,
    closer: ChannelCloser,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Next complete line without its terminator.
    ///
    /// Bytes that are not valid UTF-8 are replaced rather than rejected, so a
    /// single badly encoded line cannot end the session.
    ///
    /// Fails with `SessionClosed` when the peer closes, the socket errors,
    /// or the channel is closed locally.
    pub async fn read_line(&mut self) -> CliResult<String> {
        self.buf.clear();

        let read = tokio::select! {
            _ = self.closer.closed() => return Err(CliError::SessionClosed),
            result = self.inner.read_until(b'\n', &mut self.buf) => result,
        };

        match read {
            Ok(0) => {
                trace!("peer closed the line channel");
                self.closer.close();
                Err(CliError::SessionClosed)
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.buf);
                Ok(line.trim_end_matches(['\r', '\n']).to_string())
            }
            Err(e) => {
                debug!("line channel read error: {}", e);
                self.closer.close();
                Err(CliError::SessionClosed)
            }
        }
    }

    pub fn closer(&self) -> ChannelCloser {
        self.closer.clone()
    }
}

/// Write half of a [`LineChannel`].
pub struct LineWriter<W> {
    inner: W,
    closer: ChannelCloser,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    /// Append the terminator and flush.
    pub async fn write_line(&mut self, text: &str) -> CliResult<()> {
        if self.closer.is_closed() {
            return Err(CliError::SessionClosed);
        }

        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        if let Err(e) = self.write_all_and_flush(line.as_bytes()).await {
            debug!("line channel write error: {}", e);
            self.closer.close();
            return Err(CliError::SessionClosed);
        }
        Ok(())
    }

    async fn write_all_and_flush(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(bytes).await?;
        self.inner.flush().await
    }

    /// Shut the write side down after the channel has been closed.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            trace!("line channel shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reads_lines_without_terminators() {
        let mock = tokio_test::io::Builder::new()
            .read(b"version 8.5.1\r\ncan musicfolder 1\n")
            .build();
        let (r, w) = tokio::io::split(mock);
        let (mut reader, _writer) = LineChannel::from_parts(r, w).into_split();

        assert_eq!(reader.read_line().await.unwrap(), "version 8.5.1");
        assert_eq!(reader.read_line().await.unwrap(), "can musicfolder 1");
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let mock = tokio_test::io::Builder::new()
            .read(b"artist:Bj\xf6rk\nversion 8.5.1\n")
            .build();
        let (r, w) = tokio::io::split(mock);
        let (mut reader, _writer) = LineChannel::from_parts(r, w).into_split();

        assert_eq!(reader.read_line().await.unwrap(), "artist:Bj\u{FFFD}rk");
        assert_eq!(reader.read_line().await.unwrap(), "version 8.5.1");
    }

    #[tokio::test]
    async fn test_eof_is_session_closed() {
        let mock = tokio_test::io::Builder::new().read(b"partial\n").build();
        let (r, w) = tokio::io::split(mock);
        let (mut reader, _writer) = LineChannel::from_parts(r, w).into_split();

        assert!(reader.read_line().await.is_ok());
        assert!(matches!(
            reader.read_line().await,
            Err(CliError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_line_appends_terminator() {
        let mock = tokio_test::io::Builder::new().write(b"listen 1\n").build();
        let (r, w) = tokio::io::split(mock);
        let (_reader, mut writer) = LineChannel::from_parts(r, w).into_split();

        writer.write_line("listen 1").await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            // Accept and stay silent.
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let channel = LineChannel::open(&addr, Duration::from_secs(1)).await.unwrap();
        let closer = channel.closer();
        let (mut reader, _writer) = channel.into_split();

        let pending = tokio::spawn(async move { reader.read_line().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.close();
        closer.close();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("read should unblock")
            .unwrap();
        assert!(matches!(result, Err(CliError::SessionClosed)));
        server.abort();
    }

    #[tokio::test]
    async fn test_open_refused_is_connect_failed() {
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let result = LineChannel::open(&addr, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CliError::ConnectFailed { .. })));
    }
}
