//! A minimal echo server on the reactor.
//!
//! Accepts TCP clients, echoes every byte back, and shuts down cleanly on
//! SIGINT/SIGTERM:
//!
//! ```sh
//! cargo run --example echo -- 7000
//! ncat 127.0.0.1 7000
//! ```

use std::cell::Cell;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use mio::net::TcpStream;
use resona_event::{Connection, EventLoop, Ready, ServerSocket, SignalWatch};
use tracing_subscriber::EnvFilter;

/// Registers a read monitor that echoes until the peer hangs up. The
/// closure owns the stream; removing the monitor drops both.
fn install_echo(
    event_loop: &mut EventLoop,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let fd = stream.as_raw_fd();
    let handle_cell = Rc::new(Cell::new(None));
    let handle_for_cb = Rc::clone(&handle_cell);

    let monitor = event_loop.add_fd(fd, Ready::READ, move |lp, ready| {
        let mut closed = ready.intersects(Ready::ERROR | Ready::HANGUP);
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => {
                    // Demo simplification: a short write to a congested
                    // peer just drops the connection.
                    if let Err(error) = stream.write_all(&buf[..n]) {
                        tracing::warn!(%peer, %error, "write failed");
                        closed = true;
                        break;
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    tracing::warn!(%peer, %error, "read failed");
                    closed = true;
                    break;
                }
            }
        }
        if closed {
            if let Some(handle) = handle_for_cb.get() {
                if let Err(error) = lp.remove_fd(handle) {
                    tracing::warn!(%peer, %error, "failed to deregister client");
                }
            }
            tracing::info!(%peer, "client disconnected");
        }
    })?;
    handle_cell.set(Some(monitor));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<u16>())
        .transpose()?
        .unwrap_or(6600);

    let mut event_loop = EventLoop::new()?;

    let mut server = ServerSocket::new(|lp, connection| match connection {
        Connection::Tcp { stream, peer } => {
            tracing::info!(%peer, "client connected");
            if let Err(error) = install_echo(lp, stream, peer) {
                tracing::warn!(%peer, %error, "failed to install echo monitor");
            }
        }
        Connection::Local { .. } => {}
    });
    server.add_port(port);
    server.open(&mut event_loop)?;
    for address in server.bound_tcp_addrs() {
        tracing::info!(%address, "listening");
    }

    let interrupt = SignalWatch::new(&mut event_loop, libc::SIGINT, |lp| {
        tracing::info!("interrupt, shutting down");
        lp.break_loop();
    })?;
    let terminate = SignalWatch::new(&mut event_loop, libc::SIGTERM, |lp| lp.break_loop())?;

    event_loop.run()?;

    interrupt.close(&mut event_loop)?;
    terminate.close(&mut event_loop)?;
    server.close(&mut event_loop);
    Ok(())
}
