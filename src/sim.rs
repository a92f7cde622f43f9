//! Simulated network
//!
//! Runs one server and any number of clients against each other on a virtual millisecond clock.
//! Every datagram crosses a [`LinkConfig`] link, modelled independently per direction and per
//! client:
//!
//! * a serialization stage at `bandwidth_bps`, behind a drop-tail backlog of `queue_limit_ms`
//! * a fixed propagation `delay_ms`, plus a uniform random `jitter_ms` which may reorder
//! * independent random loss at `loss_rate`
//!
//! All randomness comes from one generator seeded with `seed`, so a run is fully reproducible.

use std::collections::HashMap;
use std::net;
use std::ops::Range;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::config::{ClientConfig, LinkConfig, ServerConfig};
use crate::error::Result;
use crate::player::{self, Player, TickOutcome};
use crate::session::{self, SessionManager};
use crate::timer_queue::{TimerId, TimerQueue};

const SERVER_PORT: u16 = 5000;
const CLIENT_PORT: u16 = 49152;

#[derive(Debug)]
enum SimEvent {
    Deliver {
        from: net::SocketAddr,
        to: net::SocketAddr,
        bytes: Box<[u8]>,
    },
    ClientTick(usize),
    ServerSend(net::SocketAddr),
}

/// Datagram and send counters for a whole run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NetworkStats {
    pub datagrams_sent: u64,
    pub datagrams_delivered: u64,
    /// Dropped by random loss.
    pub datagrams_lost: u64,
    /// Dropped by a full link backlog.
    pub datagrams_dropped: u64,
    pub windows_sent: u64,
}

struct Network {
    now_ms: u64,
    queue: TimerQueue<SimEvent>,
    link: LinkConfig,
    rng: StdRng,
    // Per-direction serialization state, in microseconds
    busy_until_us: HashMap<(net::SocketAddr, net::SocketAddr), u64>,
    stats: NetworkStats,
}

impl Network {
    fn transmit(&mut self, from: net::SocketAddr, to: net::SocketAddr, bytes: &[u8]) {
        self.stats.datagrams_sent += 1;

        let now_us = self.now_ms * 1000;
        let mut depart_us = now_us;

        if let Some(bandwidth_bps) = self.link.bandwidth_bps {
            let busy_until_us = self.busy_until_us.entry((from, to)).or_insert(0);

            let start_us = (*busy_until_us).max(now_us);

            if start_us - now_us > self.link.queue_limit_ms * 1000 {
                trace!("{} -> {}: backlog full, dropping datagram", from, to);
                self.stats.datagrams_dropped += 1;
                return;
            }

            let tx_time_us = (bytes.len() as u64 * 8 * 1_000_000).div_ceil(bandwidth_bps);

            *busy_until_us = start_us + tx_time_us;
            depart_us = *busy_until_us;
        }

        if self.link.loss_rate > 0.0 && self.rng.gen_bool(self.link.loss_rate) {
            trace!("{} -> {}: datagram lost", from, to);
            self.stats.datagrams_lost += 1;
            return;
        }

        let jitter_ms = if self.link.jitter_ms > 0 {
            self.rng.gen_range(0..=self.link.jitter_ms)
        } else {
            0
        };

        let arrival_ms = depart_us.div_ceil(1000) + self.link.delay_ms + jitter_ms;

        self.queue.set_timer(
            arrival_ms,
            SimEvent::Deliver {
                from,
                to,
                bytes: bytes.into(),
            },
        );
    }
}

struct ServerContext<'a> {
    net: &'a mut Network,
    addr: net::SocketAddr,
}

impl<'a> session::HostContext for ServerContext<'a> {
    fn send_frame(&mut self, frame_bytes: &[u8], addr: &net::SocketAddr) {
        self.net.transmit(self.addr, *addr, frame_bytes);
    }

    fn set_send_timer(&mut self, addr: &net::SocketAddr, time_ms: u64) -> TimerId {
        self.net.queue.set_timer(time_ms, SimEvent::ServerSend(*addr))
    }

    fn unset_send_timer(&mut self, timer_id: TimerId) {
        self.net.queue.unset_timer(timer_id);
    }

    fn on_window_sent(&mut self, _addr: &net::SocketAddr, _window: Range<u32>, _chunks: u64) {
        self.net.stats.windows_sent += 1;
    }
}

/// What a simulated client has observed so far.
#[derive(Debug, Default)]
pub struct ClientRecord {
    /// Every tick outcome, with its virtual time.
    pub ticks: Vec<(u64, TickOutcome)>,
    /// Every level change as `(time_ms, from, to)`.
    pub level_changes: Vec<(u64, usize, usize)>,
    pub finished_at_ms: Option<u64>,
}

struct ClientHost {
    tick_timer: Option<TimerId>,
    record: ClientRecord,
}

struct ClientContext<'a> {
    net: &'a mut Network,
    index: usize,
    addr: net::SocketAddr,
    server_addr: net::SocketAddr,
    host: &'a mut ClientHost,
}

impl<'a> player::HostContext for ClientContext<'a> {
    fn send_frame(&mut self, frame_bytes: &[u8]) {
        self.net.transmit(self.addr, self.server_addr, frame_bytes);
    }

    fn set_tick_timer(&mut self, time_ms: u64) {
        let timer_id = self.net.queue.set_timer(time_ms, SimEvent::ClientTick(self.index));

        if let Some(old_id) = self.host.tick_timer.replace(timer_id) {
            self.net.queue.unset_timer(old_id);
        }
    }

    fn unset_tick_timer(&mut self) {
        if let Some(timer_id) = self.host.tick_timer.take() {
            self.net.queue.unset_timer(timer_id);
        }
    }

    fn on_tick(&mut self, outcome: TickOutcome) {
        self.host.record.ticks.push((self.net.now_ms, outcome));
    }

    fn on_level_change(&mut self, from: usize, to: usize) {
        self.host
            .record
            .level_changes
            .push((self.net.now_ms, from, to));
    }

    fn on_finished(&mut self) {
        self.host.record.finished_at_ms = Some(self.net.now_ms);
    }
}

/// A client taking part in a simulation.
pub struct SimClient {
    addr: net::SocketAddr,
    player: Player,
    host: ClientHost,
}

impl SimClient {
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    pub fn record(&self) -> &ClientRecord {
        &self.host.record
    }

    pub fn is_finished(&self) -> bool {
        self.player.is_finished()
    }
}

pub struct Simulation {
    net: Network,
    server_addr: net::SocketAddr,
    server: SessionManager,
    clients: Vec<SimClient>,
    client_index: HashMap<net::SocketAddr, usize>,
}

impl Simulation {
    /// Creates a simulation containing only a server, at virtual time zero.
    pub fn new(server_config: ServerConfig, link: LinkConfig) -> Result<Self> {
        server_config.validate()?;
        link.validate()?;

        let rng = StdRng::seed_from_u64(link.seed);

        Ok(Self {
            net: Network {
                now_ms: 0,
                queue: TimerQueue::new(0),
                link,
                rng,
                busy_until_us: HashMap::new(),
                stats: NetworkStats::default(),
            },
            server_addr: (net::Ipv4Addr::new(10, 0, 0, 1), SERVER_PORT).into(),
            server: SessionManager::new(&server_config),
            clients: Vec::new(),
            client_index: HashMap::new(),
        })
    }

    /// Adds a client which starts streaming at the current virtual time. Returns its index.
    pub fn add_client(&mut self, config: ClientConfig) -> Result<usize> {
        config.validate()?;

        let index = self.clients.len();

        let host_id = u32::try_from(index + 2)
            .map_err(|_| crate::Error::Config("too many simulated clients".into()))?;
        let addr = (net::Ipv4Addr::from(0x0a00_0000 | host_id), CLIENT_PORT).into();

        let mut client = SimClient {
            addr,
            player: Player::new(&config),
            host: ClientHost {
                tick_timer: None,
                record: ClientRecord::default(),
            },
        };

        let now_ms = self.net.now_ms;

        client.player.init(
            now_ms,
            &mut ClientContext {
                net: &mut self.net,
                index,
                addr,
                server_addr: self.server_addr,
                host: &mut client.host,
            },
        );

        self.clients.push(client);
        self.client_index.insert(addr, index);

        Ok(index)
    }

    fn handle_event(&mut self, timer_id: TimerId, event: SimEvent) {
        let now_ms = self.net.now_ms;

        match event {
            SimEvent::Deliver { from, to, bytes } => {
                self.net.stats.datagrams_delivered += 1;

                if to == self.server_addr {
                    let ctx = &mut ServerContext {
                        net: &mut self.net,
                        addr: self.server_addr,
                    };

                    self.server.handle_frame(&bytes, &from, now_ms, ctx);
                } else if let Some(&index) = self.client_index.get(&to) {
                    self.clients[index].player.handle_frame(&bytes);
                } else {
                    trace!("{} -> {}: no such host", from, to);
                }
            }
            SimEvent::ClientTick(index) => {
                let client = &mut self.clients[index];

                client.host.tick_timer = None;

                let ctx = &mut ClientContext {
                    net: &mut self.net,
                    index,
                    addr: client.addr,
                    server_addr: self.server_addr,
                    host: &mut client.host,
                };

                client.player.handle_tick_timer(now_ms, ctx);
            }
            SimEvent::ServerSend(addr) => {
                let ctx = &mut ServerContext {
                    net: &mut self.net,
                    addr: self.server_addr,
                };

                self.server.handle_send_timer(&addr, timer_id, ctx);
            }
        }
    }

    /// Processes every event due at or before `time_ms`, then advances the clock to `time_ms`.
    fn step_to(&mut self, time_ms: u64) {
        self.net.now_ms = self.net.now_ms.max(time_ms);

        while let Some((timer_id, event)) = self.net.queue.pop_expired(self.net.now_ms) {
            self.handle_event(timer_id, event);
        }
    }

    /// Runs until virtual time `end_ms`.
    pub fn run_until(&mut self, end_ms: u64) {
        while let Some(next_ms) = self.net.queue.next_expiration_time_ms() {
            if next_ms > end_ms {
                break;
            }

            self.step_to(next_ms);
        }

        self.net.now_ms = self.net.now_ms.max(end_ms);
    }

    /// Runs until every client has finished or virtual time passes `limit_ms`. Returns whether
    /// every client finished.
    pub fn run_until_finished(&mut self, limit_ms: u64) -> bool {
        while !self.all_finished() {
            match self.net.queue.next_expiration_time_ms() {
                Some(next_ms) if next_ms <= limit_ms => self.step_to(next_ms),
                _ => break,
            }
        }

        self.all_finished()
    }

    /// Stops every client and the server, cancelling all ticks and sends. Datagrams already in
    /// flight are still delivered, and ignored.
    pub fn stop(&mut self) {
        for (index, client) in self.clients.iter_mut().enumerate() {
            client.player.stop(&mut ClientContext {
                net: &mut self.net,
                index,
                addr: client.addr,
                server_addr: self.server_addr,
                host: &mut client.host,
            });
        }

        self.server.stop(&mut ServerContext {
            net: &mut self.net,
            addr: self.server_addr,
        });
    }

    fn all_finished(&self) -> bool {
        self.clients.iter().all(SimClient::is_finished)
    }

    pub fn now_ms(&self) -> u64 {
        self.net.now_ms
    }

    pub fn client(&self, index: usize) -> &SimClient {
        &self.clients[index]
    }

    pub fn clients(&self) -> &[SimClient] {
        &self.clients
    }

    pub fn server(&self) -> &SessionManager {
        &self.server
    }

    pub fn server_addr(&self) -> net::SocketAddr {
        self.server_addr
    }

    pub fn network_stats(&self) -> &NetworkStats {
        &self.net.stats
    }

    /// Number of scheduled events: datagrams in flight, ticks and sends.
    pub fn pending_events(&self) -> usize {
        self.net.queue.len()
    }
}
