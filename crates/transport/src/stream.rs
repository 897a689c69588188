//! Transport-agnostic connect / listen.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::TransportError;

pub trait RelayIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayIo for T {}

/// A connected stream of any transport.
pub type RelayStream = Box<dyn RelayIo>;

/// Connect with an overall deadline.
pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<RelayStream, TransportError> {
    match tokio::time::timeout(timeout, connect_inner(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

async fn connect_inner(endpoint: &Endpoint) -> Result<RelayStream, TransportError> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        #[cfg(windows)]
        Endpoint::NamedPipe(name) => connect_pipe(name).await,
        other => Err(TransportError::Unsupported(other.to_string())),
    }
}

#[cfg(windows)]
async fn connect_pipe(name: &str) -> Result<RelayStream, TransportError> {
    use tokio::net::windows::named_pipe::ClientOptions;

    // ERROR_PIPE_BUSY: every server instance is taken; the caller's deadline bounds the retry.
    const ERROR_PIPE_BUSY: i32 = 231;
    loop {
        match ClientOptions::new().open(name) {
            Ok(client) => return Ok(Box::new(client)),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A bound listener. Unix socket files are removed on drop.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: std::path::PathBuf,
    },
    #[cfg(windows)]
    Pipe {
        name: String,
        next: tokio::net::windows::named_pipe::NamedPipeServer,
    },
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Listener, TransportError> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => bind_unix(path),
            #[cfg(windows)]
            Endpoint::NamedPipe(name) => {
                use tokio::net::windows::named_pipe::ServerOptions;
                let next = ServerOptions::new().first_pipe_instance(true).create(name)?;
                Ok(Listener::Pipe {
                    name: name.clone(),
                    next,
                })
            }
            other => Err(TransportError::Unsupported(other.to_string())),
        }
    }

    pub async fn accept(&mut self) -> io::Result<RelayStream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true).ok();
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            #[cfg(windows)]
            Listener::Pipe { name, next } => {
                use tokio::net::windows::named_pipe::ServerOptions;
                next.connect().await?;
                let fresh = ServerOptions::new().create(name.as_str())?;
                let connected = std::mem::replace(next, fresh);
                Ok(Box::new(connected))
            }
        }
    }

    /// The endpoint actually bound (resolves TCP port 0).
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            #[cfg(windows)]
            Listener::Pipe { name, .. } => Ok(Endpoint::NamedPipe(name.clone())),
        }
    }
}

#[cfg(unix)]
fn bind_unix(path: &std::path::Path) -> Result<Listener, TransportError> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Callers hold the daemon lock, so an existing file is a leftover.
    if path.exists() {
        debug!(
            component = "transport",
            event = "transport.stale_socket_removed",
            path = %path.display(),
        );
        std::fs::remove_file(path)?;
    }
    let listener = tokio::net::UnixListener::bind(path)?;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!(
            component = "transport",
            event = "transport.socket_chmod_failed",
            path = %path.display(),
            error = %e,
        );
    }
    Ok(Listener::Unix {
        listener,
        path: path.to_path_buf(),
    })
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(&*path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tcp_round_trip_on_ephemeral_port() {
        let mut listener = Listener::bind(&Endpoint::loopback(0)).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut client = connect(&endpoint, Duration::from_secs(1)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        assert_eq!(server.await.unwrap(), b"ping");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_replaces_stale_file_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        std::fs::write(&path, "stale").unwrap();

        let listener = Listener::bind(&Endpoint::Unix(path.clone())).await.unwrap();
        assert_eq!(
            listener.local_endpoint().unwrap(),
            Endpoint::Unix(path.clone())
        );
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails_fast() {
        let listener = Listener::bind(&Endpoint::loopback(0)).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        drop(listener);

        assert!(connect(&endpoint, Duration::from_secs(1)).await.is_err());
    }
}
