//! Client playback controller
//!
//! Playback advances in ticks. On each tick the player either has enough buffered frames to cover
//! one tick of consumption (playing) or it does not (filling). No state is stored for this: it is
//! derived from the buffer every tick.
//!
//! The protocol is pull-based, so the player re-issues a REQUEST on every tick for as long as
//! frames remain undelivered, including while filling. Lost requests or chunks are recovered by
//! the next tick's request.
//!
//! Level changes are carried by the next REQUEST: a tick sends its request first and then
//! switches level. The rebuffer streak is only reset by a playing tick, so once the threshold is
//! reached every further underrun steps down one more level.

use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::frame::{self, serial, Message, RequestFrame};
use crate::ladder::QualityLadder;
use crate::reassembly::{FrameTracker, Receipt};

/// Services a player needs from its host: a way to reach the server, a single tick timer, and an
/// event sink.
pub trait HostContext {
    fn send_frame(&mut self, frame_bytes: &[u8]);
    fn set_tick_timer(&mut self, time_ms: u64);
    fn unset_tick_timer(&mut self);
    fn on_tick(&mut self, outcome: TickOutcome);
    fn on_level_change(&mut self, from: usize, to: usize);
    fn on_finished(&mut self);
}

/// Result of a playback tick.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TickOutcome {
    /// Not enough frames were buffered to play this tick.
    Underrun { buffered: u32, streak: u32 },
    /// One tick of frames was consumed.
    Played { buffered: u32, playback_time_s: u32 },
    /// Every frame has been delivered and the buffer has run dry. Playback is over.
    Exhausted,
}

/// Counters accumulated over a playback session.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PlaybackStats {
    /// Seconds of video played, one per playing tick.
    pub playback_time_s: u32,
    /// Quality level currently selected.
    pub level: usize,
    pub ticks_played: u32,
    pub underrun_ticks: u32,
    pub upgrades: u32,
    pub downgrades: u32,
    pub requests_sent: u32,
    pub chunks_received: u32,
    pub duplicate_chunks: u32,
    pub malformed_frames: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Idle,
    Running,
    Finished,
    Stopped,
}

pub struct Player {
    chunk_size: u32,
    consumption_rate: u32,
    lookahead_window_secs: u32,
    rebuffer_threshold: u32,
    initial_delay_ms: u64,
    tick_interval_ms: u64,

    ladder: QualityLadder,
    tracker: FrameTracker,
    rebuffer_streak: u32,
    state: State,
    stats: PlaybackStats,
    // Always-allocated outbound datagram
    frame_buffer: Box<[u8]>,
}

impl Player {
    /// Creates an idle player. `config` must have passed validation.
    pub fn new(config: &ClientConfig) -> Self {
        let stream = &config.stream;
        let playback = &config.playback;

        let ladder = QualityLadder::new(stream.quality_ladder.clone(), playback.initial_level);
        let initial_level = ladder.level();

        let tracker = FrameTracker::new(
            stream.chunk_size,
            stream.total_frames,
            ladder.max_resolution(),
        );

        Self {
            chunk_size: stream.chunk_size,
            consumption_rate: playback.consumption_rate(),
            lookahead_window_secs: stream.lookahead_window_secs,
            rebuffer_threshold: playback.rebuffer_threshold,
            initial_delay_ms: playback.initial_delay_ms,
            tick_interval_ms: playback.tick_interval_ms,
            ladder,
            tracker,
            rebuffer_streak: 0,
            state: State::Idle,
            stats: PlaybackStats {
                level: initial_level,
                ..Default::default()
            },
            frame_buffer: vec![0; stream.chunk_size as usize].into_boxed_slice(),
        }
    }

    /// Sends the initial request and schedules the first tick.
    pub fn init(&mut self, now_ms: u64, ctx: &mut impl HostContext) {
        assert_eq!(self.state, State::Idle, "player initialized twice");

        self.state = State::Running;

        self.send_request(ctx);

        ctx.set_tick_timer(now_ms + self.initial_delay_ms);
    }

    /// Handles one inbound datagram from the server.
    pub fn handle_frame(&mut self, frame_bytes: &[u8]) {
        if self.state != State::Running {
            return;
        }

        match serial::read(frame_bytes) {
            Ok(Message::Data(data)) => {
                match self.tracker.receive(&data) {
                    Receipt::Accepted { completed } => {
                        self.stats.chunks_received += 1;

                        if completed > 0 {
                            trace!(
                                "frames up to {} complete, {} buffered",
                                self.tracker.last_received_frame(),
                                self.tracker.buffered_frames()
                            );
                        }
                    }
                    Receipt::Duplicate | Receipt::Stale => {
                        self.stats.duplicate_chunks += 1;
                    }
                    Receipt::OutOfRange => {
                        warn!(
                            "dropping chunk {}/{} outside of stream",
                            data.frame_index, data.chunk_index
                        );
                    }
                }
            }
            Ok(Message::Request(_)) => {
                self.stats.malformed_frames += 1;
                warn!("dropping request frame received from server");
            }
            Err(err) => {
                self.stats.malformed_frames += 1;
                warn!("dropping frame: {}", err);
            }
        }
    }

    /// Runs one playback tick.
    pub fn handle_tick_timer(&mut self, now_ms: u64, ctx: &mut impl HostContext) -> TickOutcome {
        assert_eq!(self.state, State::Running, "tick on inactive player");

        let rate = self.consumption_rate;

        let outcome = if self.tracker.buffered_frames() < rate {
            if self.tracker.is_exhausted() {
                return self.finish(ctx);
            }

            self.rebuffer_streak += 1;
            self.stats.underrun_ticks += 1;

            self.send_request(ctx);

            if self.rebuffer_streak >= self.rebuffer_threshold && self.ladder.can_step_down() {
                let from = self.ladder.level();
                self.ladder.step_down();
                self.stats.downgrades += 1;
                self.stats.level = self.ladder.level();

                debug!("rebuffering, level {} -> {}", from, self.ladder.level());

                ctx.on_level_change(from, self.ladder.level());
            }

            TickOutcome::Underrun {
                buffered: self.tracker.buffered_frames(),
                streak: self.rebuffer_streak,
            }
        } else {
            self.tracker.consume(rate);
            self.stats.playback_time_s += 1;
            self.rebuffer_streak = 0;
            self.stats.ticks_played += 1;

            if !self.tracker.is_exhausted() {
                self.send_request(ctx);
            }

            if self.tracker.buffered_frames() >= rate && self.ladder.can_step_up() {
                let from = self.ladder.level();
                self.ladder.step_up();
                self.stats.upgrades += 1;
                self.stats.level = self.ladder.level();

                debug!("buffer healthy, level {} -> {}", from, self.ladder.level());

                ctx.on_level_change(from, self.ladder.level());
            }

            TickOutcome::Played {
                buffered: self.tracker.buffered_frames(),
                playback_time_s: self.stats.playback_time_s,
            }
        };

        info!(
            rebuffer_streak = self.rebuffer_streak,
            playback_time_s = self.stats.playback_time_s,
            level = self.ladder.level(),
            buffered = self.tracker.buffered_frames(),
            pending = self.tracker.pending_frames(),
            "tick"
        );

        ctx.set_tick_timer(now_ms + self.tick_interval_ms);
        ctx.on_tick(outcome);

        outcome
    }

    /// Stops playback. No further ticks or requests are produced.
    pub fn stop(&mut self, ctx: &mut impl HostContext) {
        if self.state == State::Running {
            ctx.unset_tick_timer();
        }

        self.state = State::Stopped;
    }

    fn finish(&mut self, ctx: &mut impl HostContext) -> TickOutcome {
        let leftover = self.tracker.consume(u32::MAX);

        info!(
            playback_time_s = self.stats.playback_time_s,
            leftover_frames = leftover,
            underrun_ticks = self.stats.underrun_ticks,
            "stream finished"
        );

        self.state = State::Finished;

        ctx.unset_tick_timer();
        ctx.on_tick(TickOutcome::Exhausted);
        ctx.on_finished();

        TickOutcome::Exhausted
    }

    fn send_request(&mut self, ctx: &mut impl HostContext) {
        let request = RequestFrame {
            resolution: self.ladder.resolution(),
            last_received_frame: self.tracker.last_received_frame(),
            consumption_rate: self.consumption_rate,
        };

        let window_start = request.last_received_frame;
        let window_end = window_start
            .saturating_add(self.consumption_rate.saturating_mul(self.lookahead_window_secs));

        // Chunks for this window will be cut at the requested resolution
        self.tracker.expect(window_start..window_end, request.resolution);

        let frame_bytes = serial::write(&Message::Request(request), &mut self.frame_buffer);

        trace!(
            "requesting frames from {} at {} bytes ({} chunks)",
            request.last_received_frame,
            request.resolution,
            frame::chunk_count(request.resolution, self.chunk_size)
        );

        ctx.send_frame(frame_bytes);

        self.stats.requests_sent += 1;
    }

    pub fn level(&self) -> usize {
        self.ladder.level()
    }

    pub fn resolution(&self) -> u32 {
        self.ladder.resolution()
    }

    pub fn consumption_rate(&self) -> u32 {
        self.consumption_rate
    }

    pub fn buffered_frames(&self) -> u32 {
        self.tracker.buffered_frames()
    }

    pub fn last_received_frame(&self) -> u32 {
        self.tracker.last_received_frame()
    }

    pub fn rebuffer_streak(&self) -> u32 {
        self.rebuffer_streak
    }

    pub fn playback_time_s(&self) -> u32 {
        self.stats.playback_time_s
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }

    pub fn stats(&self) -> &PlaybackStats {
        &self.stats
    }

    pub fn tracker(&self) -> &FrameTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{PlaybackConfig, StreamConfig};
    use crate::frame::DataFrame;

    #[derive(Default)]
    struct MockHost {
        sent: Vec<Message>,
        tick_timer: Option<u64>,
        outcomes: Vec<TickOutcome>,
        level_changes: Vec<(usize, usize)>,
        finished: bool,
    }

    impl HostContext for MockHost {
        fn send_frame(&mut self, frame_bytes: &[u8]) {
            self.sent.push(serial::read(frame_bytes).unwrap());
        }

        fn set_tick_timer(&mut self, time_ms: u64) {
            self.tick_timer = Some(time_ms);
        }

        fn unset_tick_timer(&mut self) {
            self.tick_timer = None;
        }

        fn on_tick(&mut self, outcome: TickOutcome) {
            self.outcomes.push(outcome);
        }

        fn on_level_change(&mut self, from: usize, to: usize) {
            self.level_changes.push((from, to));
        }

        fn on_finished(&mut self) {
            self.finished = true;
        }
    }

    impl MockHost {
        fn last_request(&self) -> RequestFrame {
            match self.sent.last() {
                Some(Message::Request(request)) => *request,
                other => panic!("expected request, found {:?}", other),
            }
        }
    }

    // Ladder of 1, 2 and 3 chunks per frame; 4 frames per tick
    fn config(total_frames: u32, rebuffer_threshold: u32) -> ClientConfig {
        ClientConfig {
            stream: StreamConfig {
                chunk_size: 100,
                total_frames,
                quality_ladder: vec![100, 200, 300],
                lookahead_window_secs: 5,
            },
            playback: PlaybackConfig {
                initial_level: 0,
                frame_rate: 4,
                playback_speed: 1.0,
                rebuffer_threshold,
                initial_delay_ms: 1000,
                tick_interval_ms: 1000,
            },
        }
    }

    fn deliver(player: &mut Player, frames: std::ops::Range<u32>, chunks: u32) {
        let mut buffer = [0u8; 100];

        for frame_index in frames {
            for chunk_index in 0..chunks {
                let message = Message::Data(DataFrame {
                    frame_index,
                    chunk_index,
                });
                player.handle_frame(serial::write(&message, &mut buffer));
            }
        }
    }

    #[test]
    fn init_requests_and_schedules_first_tick() {
        let mut player = Player::new(&config(100, 1));
        let mut host = MockHost::default();

        player.init(0, &mut host);

        assert_eq!(
            host.last_request(),
            RequestFrame {
                resolution: 100,
                last_received_frame: 0,
                consumption_rate: 4,
            }
        );
        assert_eq!(host.tick_timer, Some(1000));
    }

    #[test]
    fn playing_tick_consumes_and_upgrades() {
        let mut player = Player::new(&config(100, 1));
        let mut host = MockHost::default();

        player.init(0, &mut host);
        deliver(&mut player, 0..20, 1);

        assert_eq!(player.buffered_frames(), 20);

        let outcome = player.handle_tick_timer(1000, &mut host);

        assert_eq!(
            outcome,
            TickOutcome::Played {
                buffered: 16,
                playback_time_s: 1,
            }
        );
        assert_eq!(host.level_changes, vec![(0, 1)]);
        assert_eq!(host.tick_timer, Some(2000));

        // The tick's request went out before the level change
        let request = host.last_request();
        assert_eq!(request.resolution, 100);
        assert_eq!(request.last_received_frame, 20);
        assert_eq!(player.resolution(), 200);

        let stats = player.stats();
        assert_eq!(stats.playback_time_s, 1);
        assert_eq!(stats.level, 1);
        assert_eq!(stats.upgrades, 1);
    }

    #[test]
    fn no_upgrade_without_a_spare_tick() {
        let mut player = Player::new(&config(100, 1));
        let mut host = MockHost::default();

        player.init(0, &mut host);
        deliver(&mut player, 0..7, 1);

        player.handle_tick_timer(1000, &mut host);

        assert_eq!(player.buffered_frames(), 3);
        assert_eq!(player.level(), 0);
        assert!(host.level_changes.is_empty());
    }

    #[test]
    fn upgrade_when_exactly_one_tick_remains() {
        let mut player = Player::new(&config(100, 1));
        let mut host = MockHost::default();

        player.init(0, &mut host);
        deliver(&mut player, 0..8, 1);

        let outcome = player.handle_tick_timer(1000, &mut host);

        assert_eq!(
            outcome,
            TickOutcome::Played {
                buffered: 4,
                playback_time_s: 1,
            }
        );
        assert_eq!(player.level(), 1);
        assert_eq!(host.level_changes, vec![(0, 1)]);
    }

    #[test]
    fn filling_tick_leaves_buffer_and_requests() {
        let mut player = Player::new(&config(100, 2));
        let mut host = MockHost::default();

        player.init(0, &mut host);
        deliver(&mut player, 0..3, 1);

        let requests_before = host.sent.len();
        let outcome = player.handle_tick_timer(1000, &mut host);

        assert_eq!(
            outcome,
            TickOutcome::Underrun {
                buffered: 3,
                streak: 1,
            }
        );
        assert_eq!(player.buffered_frames(), 3);
        assert_eq!(host.sent.len(), requests_before + 1);
        assert_eq!(host.last_request().last_received_frame, 3);
        assert_eq!(host.tick_timer, Some(2000));
    }

    #[test]
    fn downgrade_after_threshold() {
        let mut config = config(100, 2);
        config.playback.initial_level = 2;

        let mut player = Player::new(&config);
        let mut host = MockHost::default();

        assert_eq!(player.stats().level, 2);

        player.init(0, &mut host);

        player.handle_tick_timer(1000, &mut host);
        assert_eq!(player.level(), 2);

        player.handle_tick_timer(2000, &mut host);
        assert_eq!(player.level(), 1);
        assert_eq!(player.rebuffer_streak(), 2);

        // The streak persists across the downgrade
        player.handle_tick_timer(3000, &mut host);
        assert_eq!(player.level(), 0);

        // Level 0 is the floor
        player.handle_tick_timer(4000, &mut host);
        assert_eq!(player.level(), 0);
        assert_eq!(host.level_changes, vec![(2, 1), (1, 0)]);

        // The request after the downgrade carries the new level
        assert_eq!(host.last_request().resolution, 100);
        assert_eq!(player.stats().downgrades, 2);
        assert_eq!(player.stats().level, 0);
        assert_eq!(player.stats().playback_time_s, 0);
    }

    #[test]
    fn playing_tick_resets_streak() {
        let mut player = Player::new(&config(100, 3));
        let mut host = MockHost::default();

        player.init(0, &mut host);
        player.handle_tick_timer(1000, &mut host);
        player.handle_tick_timer(2000, &mut host);
        assert_eq!(player.rebuffer_streak(), 2);

        deliver(&mut player, 0..4, 1);
        player.handle_tick_timer(3000, &mut host);
        assert_eq!(player.rebuffer_streak(), 0);
        assert_eq!(player.stats().underrun_ticks, 2);
    }

    #[test]
    fn resolution_follows_request() {
        // Frames requested at level 1 need two chunks even after the level changes locally
        let mut config = config(100, 1);
        config.playback.initial_level = 1;

        let mut player = Player::new(&config);
        let mut host = MockHost::default();

        player.init(0, &mut host);
        deliver(&mut player, 0..4, 1);
        assert_eq!(player.buffered_frames(), 0);

        deliver(&mut player, 0..4, 2);
        assert_eq!(player.buffered_frames(), 4);
    }

    #[test]
    fn stream_end() {
        let mut player = Player::new(&config(6, 1));
        let mut host = MockHost::default();

        player.init(0, &mut host);
        deliver(&mut player, 0..6, 1);

        let requests_before = host.sent.len();

        // All frames delivered: playing tick sends no request
        player.handle_tick_timer(1000, &mut host);
        assert_eq!(player.buffered_frames(), 2);
        assert_eq!(host.sent.len(), requests_before);

        let outcome = player.handle_tick_timer(2000, &mut host);

        assert_eq!(outcome, TickOutcome::Exhausted);
        assert!(player.is_finished());
        assert!(host.finished);
        assert_eq!(host.tick_timer, None);
        assert_eq!(player.buffered_frames(), 0);
        assert_eq!(player.playback_time_s(), 1);
        assert_eq!(host.sent.len(), requests_before);
    }

    #[test]
    fn malformed_and_duplicate_frames_ignored() {
        let mut player = Player::new(&config(100, 1));
        let mut host = MockHost::default();

        player.init(0, &mut host);

        player.handle_frame(b"garbage");
        player.handle_frame(b"res:1 lrf:2 fr:3");
        deliver(&mut player, 0..1, 1);
        deliver(&mut player, 0..1, 1);

        assert_eq!(player.buffered_frames(), 1);
        assert_eq!(player.stats().malformed_frames, 2);
        assert_eq!(player.stats().duplicate_chunks, 1);
    }

    #[test]
    fn stop_cancels_tick() {
        let mut player = Player::new(&config(100, 1));
        let mut host = MockHost::default();

        player.init(0, &mut host);
        player.stop(&mut host);

        assert_eq!(host.tick_timer, None);
        assert!(!player.is_running());

        deliver(&mut player, 0..4, 1);
        assert_eq!(player.buffered_frames(), 0);
    }
}
