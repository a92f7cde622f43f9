use std::net;
use std::sync::Arc;
use std::time;

use tracing::debug;

const SOCKET_POLLING_KEY: usize = 0;

/// Send half of a server socket.
pub struct SocketTx {
    // Shared non-blocking socket
    socket: Arc<net::UdpSocket>,
}

/// Receive half of a server socket.
pub struct SocketRx {
    // Shared non-blocking socket
    socket: Arc<net::UdpSocket>,
    // Cached at bind time
    local_addr: net::SocketAddr,
    poller: polling::Poller,
    poller_events: polling::Events,
    // Always-allocated receive buffer
    recv_buffer: Box<[u8]>,
}

/// Send half of a client socket, connected to its server.
pub struct ConnectedSocketTx {
    socket: Arc<net::UdpSocket>,
}

/// Receive half of a client socket. Datagrams from addresses other than the server are filtered
/// by the OS.
pub struct ConnectedSocketRx {
    socket: Arc<net::UdpSocket>,
    local_addr: net::SocketAddr,
    peer_addr: net::SocketAddr,
    poller: polling::Poller,
    poller_events: polling::Events,
    recv_buffer: Box<[u8]>,
}

fn would_block<T>(result: std::io::Result<T>) -> std::io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) => match err.kind() {
            // No datagram queued
            std::io::ErrorKind::WouldBlock => Ok(None),
            _ => Err(err),
        },
    }
}

/// Waits up to `timeout` for the socket to become readable. Returns `false` on timeout or a
/// spurious wakeup.
fn wait_readable(
    poller: &polling::Poller,
    events: &mut polling::Events,
    socket: &net::UdpSocket,
    timeout: Option<time::Duration>,
) -> std::io::Result<bool> {
    // Interest is oneshot and must be re-armed before every wait
    poller.modify(socket, polling::Event::readable(SOCKET_POLLING_KEY))?;

    events.clear();

    Ok(poller.wait(events, timeout)? > 0)
}

impl SocketTx {
    /// Sends a datagram. Delivery is best effort: failures are logged and otherwise ignored.
    pub fn send(&self, datagram: &[u8], addr: &net::SocketAddr) {
        if let Err(err) = self.socket.send_to(datagram, addr) {
            debug!("{}: send failed: {}", addr, err);
        }
    }
}

impl SocketRx {
    /// Returns the next queued datagram and its sender, or `Ok(None)` if none is queued.
    pub fn try_read_datagram(&mut self) -> std::io::Result<Option<(&[u8], net::SocketAddr)>> {
        let received = would_block(self.socket.recv_from(&mut self.recv_buffer))?;

        Ok(received.map(|(len, sender_addr)| (&self.recv_buffer[..len], sender_addr)))
    }

    /// Blocks for up to `timeout` waiting for a datagram. Returns `Ok(None)` if none arrived in
    /// time.
    pub fn wait_for_datagram(
        &mut self,
        timeout: Option<time::Duration>,
    ) -> std::io::Result<Option<(&[u8], net::SocketAddr)>> {
        if wait_readable(&self.poller, &mut self.poller_events, &self.socket, timeout)? {
            self.try_read_datagram()
        } else {
            Ok(None)
        }
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }
}

impl Drop for SocketRx {
    fn drop(&mut self) {
        let _ = self.poller.delete(&*self.socket);
    }
}

fn bind_nonblocking<A>(bind_address: A) -> std::io::Result<(net::UdpSocket, polling::Poller)>
where
    A: net::ToSocketAddrs,
{
    let socket = net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;

    let poller = polling::Poller::new()?;

    // SAFETY: the socket is removed from the poller when the receive half is dropped, before
    // the last reference to the socket goes away
    unsafe {
        poller.add(&socket, polling::Event::readable(SOCKET_POLLING_KEY))?;
    }

    Ok((socket, poller))
}

/// Binds a non-blocking socket for serving many peers.
pub fn bind<A>(bind_address: A, datagram_size_max: usize) -> std::io::Result<(SocketTx, SocketRx)>
where
    A: net::ToSocketAddrs,
{
    let (socket, poller) = bind_nonblocking(bind_address)?;

    let local_addr = socket.local_addr()?;

    let socket = Arc::new(socket);

    let tx = SocketTx {
        socket: Arc::clone(&socket),
    };

    let rx = SocketRx {
        socket,
        local_addr,
        poller,
        poller_events: polling::Events::new(),
        recv_buffer: vec![0; datagram_size_max].into_boxed_slice(),
    };

    Ok((tx, rx))
}

impl ConnectedSocketTx {
    pub fn send(&self, datagram: &[u8]) {
        if let Err(err) = self.socket.send(datagram) {
            debug!("send failed: {}", err);
        }
    }
}

impl ConnectedSocketRx {
    /// Returns the next queued datagram, or `Ok(None)` if none is queued.
    ///
    /// An ICMP port unreachable from the server surfaces here as `ConnectionRefused`; callers
    /// treat it like a lost datagram.
    pub fn try_read_datagram(&mut self) -> std::io::Result<Option<&[u8]>> {
        let received = would_block(self.socket.recv(&mut self.recv_buffer))?;

        Ok(received.map(|len| &self.recv_buffer[..len]))
    }

    pub fn wait_for_datagram(
        &mut self,
        timeout: Option<time::Duration>,
    ) -> std::io::Result<Option<&[u8]>> {
        if wait_readable(&self.poller, &mut self.poller_events, &self.socket, timeout)? {
            self.try_read_datagram()
        } else {
            Ok(None)
        }
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> net::SocketAddr {
        self.peer_addr
    }
}

impl Drop for ConnectedSocketRx {
    fn drop(&mut self) {
        let _ = self.poller.delete(&*self.socket);
    }
}

/// Binds a non-blocking socket and connects it to a single server.
pub fn bind_connected<A, B>(
    bind_address: A,
    connect_address: B,
    datagram_size_max: usize,
) -> std::io::Result<(ConnectedSocketTx, ConnectedSocketRx)>
where
    A: net::ToSocketAddrs,
    B: net::ToSocketAddrs,
{
    let (socket, poller) = bind_nonblocking(bind_address)?;
    socket.connect(connect_address)?;

    let local_addr = socket.local_addr()?;
    let peer_addr = socket.peer_addr()?;

    let socket = Arc::new(socket);

    let tx = ConnectedSocketTx {
        socket: Arc::clone(&socket),
    };

    let rx = ConnectedSocketRx {
        socket,
        local_addr,
        peer_addr,
        poller,
        poller_events: polling::Events::new(),
        recv_buffer: vec![0; datagram_size_max].into_boxed_slice(),
    };

    Ok((tx, rx))
}
