//! Network namespace resolution and namespace-bound sockets.
//!
//! Joining a namespace changes the calling thread, so every namespaced
//! socket operation runs on its own short-lived OS thread. Sockets keep
//! the namespace they were created in after that thread exits.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("Network namespace '{0}' not found")]
    NotFound(String),
    #[error("Network namespace '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Handle to a network namespace, used to create sockets inside it.
#[async_trait]
pub trait Namespace: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Bind a listening TCP socket inside the namespace.
    async fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener>;

    /// Dial `target` (`host:port`) from inside the namespace.
    async fn connect(&self, target: &str, timeout: Duration) -> io::Result<TcpStream>;
}

#[async_trait]
pub trait NamespaceResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn Namespace>, NamespaceError>;
}

/// Resolves names against a directory of namespace files such as
/// `/var/run/netns`.
#[derive(Debug, Clone)]
pub struct NetnsResolver {
    run_dir: PathBuf,
}

impl NetnsResolver {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }
}

#[async_trait]
impl NamespaceResolver for NetnsResolver {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn Namespace>, NamespaceError> {
        let path = self.run_dir.join(name);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(Arc::new(NetNamespace {
                name: name.to_string(),
                path,
            })),
            Ok(false) => Err(NamespaceError::NotFound(name.to_string())),
            Err(source) => Err(NamespaceError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }
}

/// A named namespace backed by a file under the run directory.
#[derive(Debug)]
pub struct NetNamespace {
    name: String,
    path: PathBuf,
}

impl NetNamespace {
    /// Run `op` on a fresh thread that has joined this namespace.
    async fn run_in<T, F>(&self, op: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        let (tx, rx) = oneshot::channel();

        std::thread::Builder::new()
            .name(format!("netns-{}", self.name))
            .spawn(move || {
                let _ = tx.send(enter(&path).and_then(|()| op()));
            })?;

        rx.await
            .map_err(|_| io::Error::other("namespace worker exited without a result"))?
    }
}

#[async_trait]
impl Namespace for NetNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let listener = self
            .run_in(move || {
                let listener = std::net::TcpListener::bind(addr)?;
                listener.set_nonblocking(true)?;
                Ok(listener)
            })
            .await?;
        debug!(namespace = %self.name, %addr, "Bound listener in namespace");
        TcpListener::from_std(listener)
    }

    async fn connect(&self, target: &str, timeout: Duration) -> io::Result<TcpStream> {
        let target = target.to_string();
        let stream = self
            .run_in(move || {
                let stream = connect_any(&target, timeout)?;
                stream.set_nonblocking(true)?;
                Ok(stream)
            })
            .await?;
        TcpStream::from_std(stream)
    }
}

fn connect_any(target: &str, timeout: Duration) -> io::Result<std::net::TcpStream> {
    let mut last_error = None;
    for addr in target.to_socket_addrs()? {
        match std::net::TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} resolved to no addresses", target),
        )
    }))
}

#[cfg(target_os = "linux")]
fn enter(path: &Path) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let file = std::fs::File::open(path)?;
    // SAFETY: the descriptor stays open for the whole call, and setns only
    // affects the calling thread, which is dedicated to this operation.
    let rc = unsafe { libc::setns(file.as_raw_fd(), libc::CLONE_NEWNET) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enter(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "network namespaces require Linux",
    ))
}

/// Resolver that maps every name to the agent's own namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostResolver;

#[async_trait]
impl NamespaceResolver for HostResolver {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn Namespace>, NamespaceError> {
        Ok(Arc::new(HostNamespace {
            name: name.to_string(),
        }))
    }
}

/// The agent's own namespace under a network-instance name.
#[derive(Debug)]
pub struct HostNamespace {
    name: String,
}

#[async_trait]
impl Namespace for HostNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    async fn connect(&self, target: &str, timeout: Duration) -> io::Result<TcpStream> {
        tokio::time::timeout(timeout, TcpStream::connect(target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
    }
}
