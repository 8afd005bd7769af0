//! Accept-only listener bundle.
//!
//! A [`ServerSocket`] collects bind targets (TCP addresses, resolved hosts,
//! Unix socket paths), opens them all at once, and funnels every accepted
//! connection into a single callback on the loop thread. It handles no
//! protocol traffic itself; the callback registers whatever monitors the
//! connection needs.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;

use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::event_loop::{EventLoop, EventLoopError, SocketHandle};
use crate::poll::Ready;

/// Errors collecting targets or opening a [`ServerSocket`].
#[derive(Debug, thiserror::Error)]
pub enum ServerSocketError {
    /// A host name could not be resolved to any address.
    #[error("failed to resolve {host:?}: {source}")]
    Resolve {
        /// The host name as given.
        host: String,
        /// The resolver failure.
        #[source]
        source: io::Error,
    },

    /// A target could not be bound or put into listening state.
    #[error("failed to bind {target}: {source}")]
    Bind {
        /// The address or path that failed.
        target: String,
        /// The underlying socket failure.
        #[source]
        source: io::Error,
    },

    /// A stale socket file existed at the requested path and could not be
    /// removed.
    #[error("failed to remove stale socket file {path:?}: {source}")]
    RemoveStale {
        /// The socket file path.
        path: PathBuf,
        /// The filesystem failure.
        #[source]
        source: io::Error,
    },

    /// A bound listener could not be registered with the loop.
    #[error("failed to register listener: {0}")]
    Register(#[source] EventLoopError),
}

/// One accepted connection, handed to the accept callback.
#[derive(Debug)]
pub enum Connection {
    /// A TCP client.
    Tcp {
        /// The accepted stream, already non-blocking.
        stream: TcpStream,
        /// The peer address.
        peer: SocketAddr,
    },
    /// A Unix-domain client. Local peers are typically unnamed, so no
    /// address is carried.
    Local {
        /// The accepted stream, already non-blocking.
        stream: UnixStream,
    },
}

type OnAccept = dyn FnMut(&mut EventLoop, Connection);

#[derive(Debug, Clone)]
enum BindTarget {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(address) => address.fmt(f),
            Self::Unix(path) => path.display().fmt(f),
        }
    }
}

/// Targets added by one `add_*` call. A group is satisfied as soon as one
/// of its addresses listens: `add_port` puts both wildcards in a single
/// group, so a dual-stack IPv6 bind that already covers IPv4 (making the
/// explicit IPv4 bind fail with "address in use") does not fail the open.
#[derive(Debug)]
struct BindGroup {
    targets: Vec<BindTarget>,
}

enum ListenerSocket {
    Tcp(TcpListener),
    Local(UnixListener),
}

impl ListenerSocket {
    fn raw(&self) -> RawFd {
        match self {
            Self::Tcp(listener) => listener.as_raw_fd(),
            Self::Local(listener) => listener.as_raw_fd(),
        }
    }

    fn accept(&self) -> io::Result<Connection> {
        match self {
            Self::Tcp(listener) => listener
                .accept()
                .map(|(stream, peer)| Connection::Tcp { stream, peer }),
            Self::Local(listener) => listener
                .accept()
                .map(|(stream, _peer)| Connection::Local { stream }),
        }
    }
}

struct OpenListener {
    socket: Rc<ListenerSocket>,
    monitor: SocketHandle,
}

/// A bundle of listening sockets delivering accepted connections to one
/// callback.
///
/// Usage is two-phase: collect targets with the `add_*` methods, then
/// [`open`](ServerSocket::open) them all. `open` registers each listener
/// for read-readiness; on dispatch, connections are accepted until the
/// listener is drained.
///
/// ```no_run
/// use resona_event::{Connection, EventLoop, ServerSocket};
///
/// let mut event_loop = EventLoop::new()?;
/// let mut server = ServerSocket::new(|_lp, connection| {
///     if let Connection::Tcp { peer, .. } = &connection {
///         println!("client from {peer}");
///     }
/// });
/// server.add_port(6600);
/// server.open(&mut event_loop)?;
/// event_loop.run()?;
/// server.close(&mut event_loop);
/// # Ok::<(), resona_event::Error>(())
/// ```
pub struct ServerSocket {
    on_accept: Rc<RefCell<OnAccept>>,
    groups: Vec<BindGroup>,
    listeners: Vec<OpenListener>,
}

impl ServerSocket {
    /// Creates an empty bundle delivering connections to `on_accept`.
    pub fn new<F>(on_accept: F) -> Self
    where
        F: FnMut(&mut EventLoop, Connection) + 'static,
    {
        Self {
            on_accept: Rc::new(RefCell::new(on_accept)),
            groups: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Adds the IPv6 and IPv4 wildcard addresses for `port` as one group.
    pub fn add_port(&mut self, port: u16) {
        self.groups.push(BindGroup {
            targets: vec![
                BindTarget::Tcp(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))),
                BindTarget::Tcp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))),
            ],
        });
    }

    /// Resolves `host` and adds every resulting address as one group.
    ///
    /// # Errors
    ///
    /// Returns an error if resolution fails or yields no addresses.
    pub fn add_host(&mut self, host: &str, port: u16) -> Result<(), ServerSocketError> {
        let addresses: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|source| ServerSocketError::Resolve { host: host.to_owned(), source })?
            .collect();
        if addresses.is_empty() {
            return Err(ServerSocketError::Resolve {
                host: host.to_owned(),
                source: io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses"),
            });
        }
        self.groups.push(BindGroup {
            targets: addresses.into_iter().map(BindTarget::Tcp).collect(),
        });
        Ok(())
    }

    /// Adds a single TCP address as its own group.
    pub fn add_address(&mut self, address: SocketAddr) {
        self.groups.push(BindGroup { targets: vec![BindTarget::Tcp(address)] });
    }

    /// Adds a Unix-domain socket path as its own group. Any stale socket
    /// file at the path is removed when the bundle opens.
    pub fn add_path(&mut self, path: impl Into<PathBuf>) {
        self.groups.push(BindGroup { targets: vec![BindTarget::Unix(path.into())] });
    }

    /// Binds and listens on every collected target and registers the
    /// listeners with the loop.
    ///
    /// Within a group, one listening address satisfies the group and
    /// further failures are logged at warn level. If an entire group fails,
    /// every listener opened so far is closed again and the group's error
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns the failing group's last error.
    ///
    /// # Panics
    ///
    /// Panics if the bundle is already open.
    pub fn open(&mut self, event_loop: &mut EventLoop) -> Result<(), ServerSocketError> {
        assert!(self.listeners.is_empty(), "server socket is already open");

        let mut opened = Vec::new();
        for group in &self.groups {
            let mut group_error = None;
            let mut group_satisfied = false;
            for target in &group.targets {
                match Self::open_target(target, &self.on_accept, event_loop) {
                    Ok(listener) => {
                        tracing::debug!(target = %target, "listening");
                        opened.push(listener);
                        group_satisfied = true;
                    }
                    Err(error) => {
                        if group_satisfied {
                            tracing::warn!(target = %target, error = %error, "listener skipped");
                        } else {
                            group_error = Some(error);
                        }
                    }
                }
            }
            match group_error {
                Some(error) if group_satisfied => {
                    tracing::warn!(error = %error, "listener skipped");
                }
                Some(error) => {
                    Self::close_listeners(event_loop, &mut opened);
                    return Err(error);
                }
                None => {}
            }
        }
        self.listeners = opened;
        Ok(())
    }

    fn open_target(
        target: &BindTarget,
        on_accept: &Rc<RefCell<OnAccept>>,
        event_loop: &mut EventLoop,
    ) -> Result<OpenListener, ServerSocketError> {
        let socket = match target {
            BindTarget::Tcp(address) => {
                let listener = TcpListener::bind(*address).map_err(|source| {
                    ServerSocketError::Bind { target: target.to_string(), source }
                })?;
                ListenerSocket::Tcp(listener)
            }
            BindTarget::Unix(path) => {
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(ServerSocketError::RemoveStale { path: path.clone(), source });
                    }
                }
                let listener = UnixListener::bind(path).map_err(|source| {
                    ServerSocketError::Bind { target: target.to_string(), source }
                })?;
                ListenerSocket::Local(listener)
            }
        };

        let socket = Rc::new(socket);
        let accept_socket = Rc::clone(&socket);
        let on_accept = Rc::clone(on_accept);
        let monitor = event_loop
            .add_fd(socket.raw(), Ready::READ, move |lp, _ready| {
                accept_all(&accept_socket, lp, &on_accept);
            })
            .map_err(ServerSocketError::Register)?;
        Ok(OpenListener { socket, monitor })
    }

    fn close_listeners(event_loop: &mut EventLoop, listeners: &mut Vec<OpenListener>) {
        for listener in listeners.drain(..) {
            // Deregister first; the descriptor closes when the last Rc
            // (held by the just-removed callback) drops below.
            if let Err(error) = event_loop.remove_fd(listener.monitor) {
                tracing::warn!(
                    fd = listener.socket.raw(),
                    error = %error,
                    "failed to deregister listener"
                );
            }
        }
    }

    /// Whether the bundle is currently listening.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// The local addresses of the open TCP listeners. Useful after binding
    /// port 0.
    #[must_use]
    pub fn bound_tcp_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| match &*listener.socket {
                ListenerSocket::Tcp(tcp) => tcp.local_addr().ok(),
                ListenerSocket::Local(_) => None,
            })
            .collect()
    }

    /// Deregisters and closes all listeners. The collected targets are
    /// kept; a later [`open`](ServerSocket::open) binds them anew. No-op if
    /// not open.
    pub fn close(&mut self, event_loop: &mut EventLoop) {
        if self.listeners.is_empty() {
            return;
        }
        tracing::debug!(listeners = self.listeners.len(), "server socket closing");
        let mut listeners = std::mem::take(&mut self.listeners);
        Self::close_listeners(event_loop, &mut listeners);
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        if !self.listeners.is_empty() {
            tracing::warn!(
                listeners = self.listeners.len(),
                "server socket dropped while still open"
            );
        }
    }
}

impl fmt::Debug for ServerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocket")
            .field("groups", &self.groups.len())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

/// Accepts until the listener is drained. Individual accept failures are
/// logged and the listener stays registered.
fn accept_all(
    socket: &ListenerSocket,
    event_loop: &mut EventLoop,
    on_accept: &Rc<RefCell<OnAccept>>,
) {
    loop {
        let connection = match socket.accept() {
            Ok(connection) => connection,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                tracing::error!(fd = socket.raw(), error = %error, "accept failed");
                break;
            }
        };
        (&mut *on_accept.borrow_mut())(event_loop, connection);
    }
}
