//! Server session manager
//!
//! The server keeps one session per client address. A session is created by the first REQUEST
//! from an unseen address and overwritten by every later one: the server trusts the client's
//! reported cursor and keeps no record of what was actually delivered.
//!
//! Each REQUEST (re)schedules a single send task for its session. When the task fires it emits
//! every chunk of every frame in the look-ahead window
//!
//!   [cursor, min(cursor + rate * lookahead, total_frames))
//!
//! cut at the session's current resolution. The cursor only moves when the client says so.

use std::collections::HashMap;
use std::net;
use std::ops::Range;

use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::frame::{self, serial, DataFrame, Message, RequestFrame};
use crate::timer_queue::TimerId;

/// Services the session manager needs from its host.
pub trait HostContext {
    fn send_frame(&mut self, frame_bytes: &[u8], addr: &net::SocketAddr);
    /// Schedules `handle_send_timer` for `addr` at `time_ms`.
    fn set_send_timer(&mut self, addr: &net::SocketAddr, time_ms: u64) -> TimerId;
    fn unset_send_timer(&mut self, timer_id: TimerId);

    fn on_session_open(&mut self, _addr: &net::SocketAddr) {}
    fn on_window_sent(&mut self, _addr: &net::SocketAddr, _window: Range<u32>, _chunks: u64) {}
}

/// Server-side state for one client.
#[derive(Debug)]
pub struct Session {
    addr: net::SocketAddr,
    cursor: u32,
    resolution: u32,
    consumption_rate: u32,
    // The single pending send task, if any
    send_timer: Option<TimerId>,
    requests_received: u64,
    chunks_sent: u64,
}

impl Session {
    fn new(addr: net::SocketAddr, request: &RequestFrame) -> Self {
        Self {
            addr,
            cursor: request.last_received_frame,
            resolution: request.resolution,
            consumption_rate: request.consumption_rate,
            send_timer: None,
            requests_received: 0,
            chunks_sent: 0,
        }
    }

    pub fn addr(&self) -> &net::SocketAddr {
        &self.addr
    }

    /// Next frame the client reported needing.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn consumption_rate(&self) -> u32 {
        self.consumption_rate
    }

    pub fn has_pending_send(&self) -> bool {
        self.send_timer.is_some()
    }

    pub fn requests_received(&self) -> u64 {
        self.requests_received
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }
}

/// Frames covered by one send task, clipped to the stream.
pub fn send_window(
    cursor: u32,
    consumption_rate: u32,
    lookahead_window_secs: u32,
    total_frames: u32,
) -> Range<u32> {
    let span = consumption_rate.saturating_mul(lookahead_window_secs);
    let end = cursor.saturating_add(span).min(total_frames);

    cursor.min(end)..end
}

pub struct SessionManager {
    chunk_size: u32,
    total_frames: u32,
    lookahead_window_secs: u32,
    // Resolutions a session may be served at
    quality_ladder: Vec<u32>,
    session_count_max: usize,
    sessions: HashMap<net::SocketAddr, Session>,
    // Always-allocated outbound datagram
    frame_buffer: Box<[u8]>,
    stopped: bool,
}

impl SessionManager {
    /// Creates an empty manager. `config` must have passed validation.
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            chunk_size: config.stream.chunk_size,
            total_frames: config.stream.total_frames,
            lookahead_window_secs: config.stream.lookahead_window_secs,
            quality_ladder: config.stream.quality_ladder.clone(),
            session_count_max: config.session_count_max,
            sessions: HashMap::new(),
            frame_buffer: vec![0; config.stream.chunk_size as usize].into_boxed_slice(),
            stopped: false,
        }
    }

    /// Handles one inbound datagram. Malformed datagrams are logged and dropped without touching
    /// any session.
    pub fn handle_frame(
        &mut self,
        frame_bytes: &[u8],
        sender_addr: &net::SocketAddr,
        now_ms: u64,
        ctx: &mut impl HostContext,
    ) {
        match serial::read(frame_bytes) {
            Ok(Message::Request(request)) => {
                self.handle_request(&request, sender_addr, now_ms, ctx);
            }
            Ok(Message::Data(_)) => {
                warn!("{}: dropping data frame sent to server", sender_addr);
            }
            Err(err) => {
                warn!("{}: dropping frame: {}", sender_addr, err);
            }
        }
    }

    pub fn handle_request(
        &mut self,
        request: &RequestFrame,
        sender_addr: &net::SocketAddr,
        now_ms: u64,
        ctx: &mut impl HostContext,
    ) {
        if self.stopped {
            return;
        }

        if !self.quality_ladder.contains(&request.resolution) {
            warn!(
                "{}: dropping request for resolution {} outside the quality ladder",
                sender_addr, request.resolution
            );
            return;
        }

        if !self.sessions.contains_key(sender_addr) {
            if self.sessions.len() >= self.session_count_max {
                warn!(
                    "{}: session limit of {} reached, dropping request",
                    sender_addr, self.session_count_max
                );
                return;
            }

            info!(
                "{}: new session at frame {}, {} bytes/frame, {} frames/tick",
                sender_addr,
                request.last_received_frame,
                request.resolution,
                request.consumption_rate
            );

            self.sessions
                .insert(*sender_addr, Session::new(*sender_addr, request));

            ctx.on_session_open(sender_addr);
        }

        let Some(session) = self.sessions.get_mut(sender_addr) else {
            return;
        };

        // The client's report is trusted as is
        session.cursor = request.last_received_frame;
        session.resolution = request.resolution;
        session.consumption_rate = request.consumption_rate;
        session.requests_received += 1;

        // At most one send in flight: a newer request replaces the pending one
        if let Some(timer_id) = session.send_timer.take() {
            ctx.unset_send_timer(timer_id);
        }

        if session.cursor < self.total_frames {
            session.send_timer = Some(ctx.set_send_timer(sender_addr, now_ms));
        } else {
            debug!("{}: stream fully delivered", sender_addr);
        }
    }

    /// Runs the send task for `addr`. `timer_id` identifies the firing task, which must be the
    /// session's one pending send.
    pub fn handle_send_timer(
        &mut self,
        addr: &net::SocketAddr,
        timer_id: TimerId,
        ctx: &mut impl HostContext,
    ) -> u64 {
        let session = self
            .sessions
            .get_mut(addr)
            .unwrap_or_else(|| panic!("send task fired for unknown session {}", addr));

        assert_eq!(
            session.send_timer.take(),
            Some(timer_id),
            "send task fired for {} which is not its pending send",
            addr
        );

        let window = send_window(
            session.cursor,
            session.consumption_rate,
            self.lookahead_window_secs,
            self.total_frames,
        );

        let chunks_per_frame = frame::chunk_count(session.resolution, self.chunk_size);

        for frame_index in window.clone() {
            for chunk_index in 0..chunks_per_frame {
                let message = Message::Data(DataFrame {
                    frame_index,
                    chunk_index,
                });

                let frame_bytes = serial::write(&message, &mut self.frame_buffer);

                ctx.send_frame(frame_bytes, &session.addr);
            }
        }

        let chunks = window.len() as u64 * chunks_per_frame as u64;
        session.chunks_sent += chunks;

        debug!(
            "{}: sent frames {:?} at {} bytes/frame ({} chunks)",
            addr, window, session.resolution, chunks
        );
        trace!("{}: {} chunks sent in total", addr, session.chunks_sent);

        ctx.on_window_sent(addr, window, chunks);

        chunks
    }

    /// Cancels every pending send task. Requests received afterwards are ignored.
    pub fn stop(&mut self, ctx: &mut impl HostContext) {
        self.stopped = true;

        for session in self.sessions.values_mut() {
            if let Some(timer_id) = session.send_timer.take() {
                ctx.unset_send_timer(timer_id);
            }
        }
    }

    pub fn session(&self, addr: &net::SocketAddr) -> Option<&Session> {
        self.sessions.get(addr)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
