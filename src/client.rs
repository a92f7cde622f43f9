use std::collections::VecDeque;
use std::net;
use std::time;

use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::frame::serial::DATAGRAM_SIZE_MAX;
use crate::player::{self, PlaybackStats, Player, TickOutcome};
use crate::socket;

/// Represents a client event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// Produced once per playback tick.
    Tick(TickOutcome),
    /// Produced when the quality level changes. The next request carries the new level.
    LevelChange { from: usize, to: usize },
    /// Produced once the whole stream has been played. No further events follow.
    Finished,
}

struct ClientHost {
    // Socket send handle
    socket_tx: socket::ConnectedSocketTx,
    // Pending tick, in client time
    tick_timer: Option<u64>,
    // Queue of events
    events: VecDeque<Event>,
}

struct ClientCore {
    // Timestamps are computed relative to this instant
    time_ref: time::Instant,
    player: Player,
    host: ClientHost,
}

/// A streaming client: pulls a single stream from one server and plays it back.
pub struct Client {
    core: ClientCore,
    // Socket receive handle
    socket_rx: socket::ConnectedSocketRx,
}

impl player::HostContext for ClientHost {
    fn send_frame(&mut self, frame_bytes: &[u8]) {
        self.socket_tx.send(frame_bytes);
    }

    fn set_tick_timer(&mut self, time_ms: u64) {
        self.tick_timer = Some(time_ms);
    }

    fn unset_tick_timer(&mut self) {
        self.tick_timer = None;
    }

    fn on_tick(&mut self, outcome: TickOutcome) {
        self.events.push_back(Event::Tick(outcome));
    }

    fn on_level_change(&mut self, from: usize, to: usize) {
        self.events.push_back(Event::LevelChange { from, to });
    }

    fn on_finished(&mut self) {
        self.events.push_back(Event::Finished);
    }
}

impl ClientCore {
    /// Returns the number of whole milliseconds elapsed since the client object was created.
    fn time_now_ms(&self) -> u64 {
        (time::Instant::now() - self.time_ref).as_millis() as u64
    }

    /// Returns the time remaining until the next tick.
    fn next_timer_timeout(&self) -> Option<time::Duration> {
        let now_ms = self.time_now_ms();

        self.host
            .tick_timer
            .map(|t_ms| time::Duration::from_millis(t_ms.saturating_sub(now_ms)))
    }

    fn process_timeouts(&mut self) {
        let now_ms = self.time_now_ms();

        if let Some(timeout_ms) = self.host.tick_timer {
            if now_ms >= timeout_ms {
                self.host.tick_timer = None;

                self.player.handle_tick_timer(now_ms, &mut self.host);
            }
        }
    }

    /// Reads and processes as many datagrams as possible from socket_rx without blocking.
    fn handle_frames(&mut self, socket_rx: &mut socket::ConnectedSocketRx) {
        loop {
            match socket_rx.try_read_datagram() {
                Ok(Some(frame_bytes)) => self.player.handle_frame(frame_bytes),
                Ok(None) => break,
                Err(err) => {
                    // Typically an ICMP error for an earlier request; the next tick retries
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
        socket_rx: &mut socket::ConnectedSocketRx,
        wait_timeout: Option<time::Duration>,
    ) {
        match socket_rx.wait_for_datagram(wait_timeout) {
            Ok(Some(frame_bytes)) => {
                self.player.handle_frame(frame_bytes);
                // Process any further datagrams without blocking
                self.handle_frames(socket_rx);
            }
            Ok(None) => (),
            Err(err) => debug!("receive failed: {}", err),
        }
    }
}

impl Client {
    /// Equivalent to calling [`Client::connect_with_config`] with default configuration.
    pub fn connect<A>(server_addr: A) -> Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        Self::connect_with_config(server_addr, Default::default())
    }

    /// Binds a UDP socket to an ephemeral address, sends the initial request to the server at the
    /// provided address, and schedules the first playback tick.
    ///
    /// There is no handshake: the server learns of the client from its first request, and a
    /// missing server simply shows up as underrunning ticks.
    pub fn connect_with_config<A>(server_addr: A, config: ClientConfig) -> Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        config.validate()?;

        let bind_address = (net::Ipv4Addr::UNSPECIFIED, 0);

        let (socket_tx, socket_rx) =
            socket::bind_connected(bind_address, server_addr, DATAGRAM_SIZE_MAX)?;

        info!(
            "streaming from {} at {} frames/tick",
            socket_rx.peer_addr(),
            config.playback.consumption_rate()
        );

        let mut core = ClientCore {
            time_ref: time::Instant::now(),
            player: Player::new(&config),
            host: ClientHost {
                socket_tx,
                tick_timer: None,
                events: VecDeque::new(),
            },
        };

        let now_ms = core.time_now_ms();
        core.player.init(now_ms, &mut core.host);

        Ok(Self { core, socket_rx })
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound datagrams and processes timeouts in an attempt to produce an event.
    ///
    /// Returns `None` if no events are available.
    pub fn poll_event(&mut self) -> Option<Event> {
        let core = &mut self.core;

        if core.host.events.is_empty() {
            core.handle_frames(&mut self.socket_rx);

            core.process_timeouts();
        }

        core.host.events.pop_front()
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound datagrams and processes timeouts until an event can be returned.
    ///
    /// Returns `None` once playback has ended and no events remain.
    pub fn wait_event(&mut self) -> Option<Event> {
        let core = &mut self.core;

        loop {
            if let Some(event) = core.host.events.pop_front() {
                return Some(event);
            }

            if !core.player.is_running() {
                return None;
            }

            let wait_timeout = core.next_timer_timeout();

            core.handle_frames_wait(&mut self.socket_rx, wait_timeout);

            core.process_timeouts();
        }
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound datagrams and processes timeouts until an event can be returned. Waits for a
    /// maximum duration of `timeout`.
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

                core.process_timeouts();

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

    /// Stops playback. No further requests are sent and no further events are produced.
    pub fn stop(&mut self) {
        self.core.player.stop(&mut self.core.host);
        self.core.host.events.clear();
    }

    /// Returns the local address of the internal UDP socket.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.socket_rx.local_addr()
    }

    /// Returns the server address.
    pub fn server_addr(&self) -> net::SocketAddr {
        self.socket_rx.peer_addr()
    }

    pub fn level(&self) -> usize {
        self.core.player.level()
    }

    pub fn buffered_frames(&self) -> u32 {
        self.core.player.buffered_frames()
    }

    pub fn is_finished(&self) -> bool {
        self.core.player.is_finished()
    }

    pub fn stats(&self) -> &PlaybackStats {
        self.core.player.stats()
    }
}
