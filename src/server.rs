use std::collections::VecDeque;
use std::net;
use std::ops::Range;
use std::time;

use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::frame::serial::DATAGRAM_SIZE_MAX;
use crate::session::{self, SessionManager};
use crate::socket;
use crate::timer_queue::{TimerId, TimerQueue};

/// Represents a server event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// Produced when a request arrives from a previously unseen address.
    SessionOpened(net::SocketAddr),
    /// Produced after each send task, with the frames covered and the number of chunks sent.
    WindowSent {
        addr: net::SocketAddr,
        window: Range<u32>,
        chunks: u64,
    },
}

struct ServerHost {
    // Socket send handle
    socket_tx: socket::SocketTx,
    // One pending send task per session, keyed by session address
    send_timers: TimerQueue<net::SocketAddr>,
    // Queue of events
    events: VecDeque<Event>,
}

struct ServerCore {
    // Timestamps are computed relative to this instant
    time_ref: time::Instant,
    manager: SessionManager,
    host: ServerHost,
}

/// A streaming server. Serves any number of clients, up to the configured session limit, from a
/// single UDP socket.
pub struct Server {
    core: ServerCore,
    // Socket receive handle
    socket_rx: socket::SocketRx,
}

impl session::HostContext for ServerHost {
    fn send_frame(&mut self, frame_bytes: &[u8], addr: &net::SocketAddr) {
        self.socket_tx.send(frame_bytes, addr);
    }

    fn set_send_timer(&mut self, addr: &net::SocketAddr, time_ms: u64) -> TimerId {
        self.send_timers.set_timer(time_ms, *addr)
    }

    fn unset_send_timer(&mut self, timer_id: TimerId) {
        self.send_timers.unset_timer(timer_id);
    }

    fn on_session_open(&mut self, addr: &net::SocketAddr) {
        self.events.push_back(Event::SessionOpened(*addr));
    }

    fn on_window_sent(&mut self, addr: &net::SocketAddr, window: Range<u32>, chunks: u64) {
        self.events.push_back(Event::WindowSent {
            addr: *addr,
            window,
            chunks,
        });
    }
}

impl ServerCore {
    /// Returns the number of whole milliseconds elapsed since the server object was created.
    fn time_now_ms(&self) -> u64 {
        (time::Instant::now() - self.time_ref).as_millis() as u64
    }

    /// Returns the time until the next send task is due, if one exists.
    fn next_timer_timeout(&self) -> Option<time::Duration> {
        let now_ms = self.time_now_ms();

        self.host
            .send_timers
            .next_expiration_time_ms()
            .map(|expire_time_ms| time::Duration::from_millis(expire_time_ms.saturating_sub(now_ms)))
    }

    /// Runs all due send tasks.
    fn handle_timeouts(&mut self) {
        let now_ms = self.time_now_ms();

        while let Some((timer_id, addr)) = self.host.send_timers.pop_expired(now_ms) {
            self.manager
                .handle_send_timer(&addr, timer_id, &mut self.host);
        }
    }

    /// Reads and processes as many datagrams as possible from socket_rx without blocking.
    fn handle_frames(&mut self, socket_rx: &mut socket::SocketRx) {
        loop {
            match socket_rx.try_read_datagram() {
                Ok(Some((frame_bytes, sender_addr))) => {
                    let now_ms = self.time_now_ms();

                    self.manager
                        .handle_frame(frame_bytes, &sender_addr, now_ms, &mut self.host);
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("receive failed: {}", err);
                    break;
                }
            }
        }
    }

    /// Reads and processes as many datagrams as possible from socket_rx, waiting up to
    /// `wait_timeout` for the first.
    fn handle_frames_wait(
        &mut self,
        socket_rx: &mut socket::SocketRx,
        wait_timeout: Option<time::Duration>,
    ) {
        match socket_rx.wait_for_datagram(wait_timeout) {
            Ok(Some((frame_bytes, sender_addr))) => {
                let now_ms = self.time_now_ms();

                self.manager
                    .handle_frame(frame_bytes, &sender_addr, now_ms, &mut self.host);

                // Process any further datagrams without blocking
                self.handle_frames(socket_rx);
            }
            Ok(None) => (),
            Err(err) => debug!("receive failed: {}", err),
        }
    }
}

impl Server {
    /// Equivalent to calling [`Server::bind_with_config`] with default configuration.
    pub fn bind<A>(bind_addr: A) -> Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        Self::bind_with_config(bind_addr, Default::default())
    }

    /// Binds a UDP socket to the provided address and returns a new server object. Errors
    /// encountered during socket initialization are forwarded to the caller.
    pub fn bind_with_config<A>(bind_addr: A, config: ServerConfig) -> Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        config.validate()?;

        let (socket_tx, socket_rx) = socket::bind(bind_addr, DATAGRAM_SIZE_MAX)?;

        info!(
            "serving {} frames in {} byte chunks on {}",
            config.stream.total_frames,
            config.stream.chunk_size,
            socket_rx.local_addr()
        );

        let core = ServerCore {
            time_ref: time::Instant::now(),
            manager: SessionManager::new(&config),
            host: ServerHost {
                socket_tx,
                send_timers: TimerQueue::new(0),
                events: VecDeque::new(),
            },
        };

        Ok(Self { core, socket_rx })
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound datagrams and runs due send tasks in an attempt to produce an event.
    ///
    /// Returns `None` if no events are available.
    pub fn poll_event(&mut self) -> Option<Event> {
        let core = &mut self.core;

        if core.host.events.is_empty() {
            core.handle_frames(&mut self.socket_rx);

            core.handle_timeouts();
        }

        core.host.events.pop_front()
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound datagrams and runs due send tasks until an event can be returned.
    pub fn wait_event(&mut self) -> Event {
        let core = &mut self.core;

        loop {
            if let Some(event) = core.host.events.pop_front() {
                return event;
            }

            let wait_timeout = core.next_timer_timeout();

            core.handle_frames_wait(&mut self.socket_rx, wait_timeout);

            core.handle_timeouts();
        }
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound datagrams and runs due send tasks until an event can be returned. Waits for
    /// a maximum duration of `timeout`.
    ///
    /// Returns `None` if no events were available within `timeout`.
    pub fn wait_event_timeout(&mut self, timeout: time::Duration) -> Option<Event> {
        let core = &mut self.core;

        if core.host.events.is_empty() {
            let mut remaining_timeout = timeout;
            let mut wait_begin = time::Instant::now();

            loop {
                let wait_timeout = match core.next_timer_timeout() {
                    Some(timer_timeout) => remaining_timeout.min(timer_timeout),
                    None => remaining_timeout,
                };

                core.handle_frames_wait(&mut self.socket_rx, Some(wait_timeout));

                core.handle_timeouts();

                if !core.host.events.is_empty() {
                    break;
                }

                let now = time::Instant::now();
                let elapsed_time = now - wait_begin;

                if elapsed_time >= remaining_timeout {
                    break;
                }

                remaining_timeout -= elapsed_time;
                wait_begin = now;
            }
        }

        core.host.events.pop_front()
    }

    /// Cancels every pending send task. Sessions remain, and a later request restarts sending.
    pub fn stop(&mut self) {
        self.core.manager.stop(&mut self.core.host);
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.socket_rx.local_addr()
    }

    pub fn session_count(&self) -> usize {
        self.core.manager.session_count()
    }
}
