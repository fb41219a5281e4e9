use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tracing::{error, info};

use tgdump_core::{config::Config, errors::Error, Result};

/// Where the telegram-cli control socket lives.
#[derive(Clone, Debug)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(String, u16),
}

impl Endpoint {
    /// A configured socket path wins over host:port.
    pub fn from_config(cfg: &Config) -> Self {
        #[cfg(unix)]
        if let Some(path) = &cfg.tg_sock {
            return Self::Unix(path.clone());
        }
        Self::Tcp(cfg.tg_host.clone(), cfg.tg_port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

trait ControlStream: AsyncBufRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncBufRead + AsyncWrite + Unpin + Send + Sync> ControlStream for T {}

/// Owns the control socket. The connection is this struct's exclusive
/// resource; nothing else touches the stream directly.
pub struct Transport {
    endpoint: Endpoint,
    conn_timeout: Duration,
    retry_delay: Duration,
    conn: Option<Box<dyn ControlStream>>,
}

impl Transport {
    pub fn new(endpoint: Endpoint, conn_timeout: Duration, retry_delay: Duration) -> Self {
        Self {
            endpoint,
            conn_timeout,
            retry_delay,
            conn: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Idempotent. Retries inside a single wall-clock window; running out
    /// of window is fatal for the whole run.
    pub async fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let connected = timeout(self.conn_timeout, self.connect_loop()).await;
        match connected {
            Ok(conn) => {
                self.conn = Some(conn);
                Ok(())
            }
            Err(_) => Err(Error::Fatal(
                "no connection attempts left, aborting".to_string(),
            )),
        }
    }

    async fn connect_loop(&self) -> Box<dyn ControlStream> {
        loop {
            info!(
                "Attaching to telegram-cli control socket at {}",
                self.endpoint
            );
            match self.try_connect().await {
                Ok(conn) => return conn,
                Err(e) => {
                    error!(
                        "Failed to attach (\"{e}\"), retrying in {:?}",
                        self.retry_delay
                    );
                    sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> io::Result<Box<dyn ControlStream>> {
        match &self.endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok(Box::new(BufReader::new(stream)))
            }
            Endpoint::Tcp(host, port) => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                Ok(Box::new(BufReader::new(stream)))
            }
        }
    }

    /// Safe to call when already disconnected.
    pub async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.shutdown().await;
        }
    }

    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let conn = self.conn.as_mut().ok_or_else(not_connected)?;
        conn.write_all(line.as_bytes()).await?;
        conn.write_all(b"\n").await?;
        conn.flush().await
    }

    /// One protocol line, without its line ending. EOF is an error: the
    /// protocol never ends a response mid-exchange.
    pub async fn read_line(&mut self) -> io::Result<String> {
        let conn = self.conn.as_mut().ok_or_else(not_connected)?;
        let mut line = String::new();
        let n = conn.read_line(&mut line).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of stream",
            ));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is not connected")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const FAST: Duration = Duration::from_millis(200);
    const RETRY: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn connect_window_exhaustion_is_fatal() {
        // Bind then drop so the port is very likely to refuse connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = Transport::new(
            Endpoint::Tcp("127.0.0.1".to_string(), port),
            FAST,
            RETRY,
        );
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)), "got {err:?}");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn connect_and_disconnect_are_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut open = Vec::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                // Keep the connection open.
                open.push(stream);
            }
        });

        let mut transport = Transport::new(
            Endpoint::Tcp(addr.ip().to_string(), addr.port()),
            FAST,
            RETRY,
        );
        transport.connect().await.unwrap();
        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        transport.disconnect().await;
        transport.disconnect().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn eof_reads_as_unexpected_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut transport = Transport::new(
            Endpoint::Tcp(addr.ip().to_string(), addr.port()),
            FAST,
            RETRY,
        );
        transport.connect().await.unwrap();
        let err = transport.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connects_over_a_unix_socket() {
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tg.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hello\n").await.unwrap();
        });

        let mut transport = Transport::new(Endpoint::Unix(path), FAST, RETRY);
        transport.connect().await.unwrap();
        assert_eq!(transport.read_line().await.unwrap(), "hello");
    }
}
