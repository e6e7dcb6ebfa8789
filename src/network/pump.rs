//! Tick Pump
//!
//! [`Session::tick`] is the only entry point the embedding loop calls. Each
//! call advances logical time by `delta` and then runs, when due:
//!
//! 1. send phase: flush queued datagrams
//! 2. receive phase: host loopback queue, then transport events (capped)
//! 3. server event tick, with overshoot compensation
//! 4. time sync broadcast (every 30 s of logical time, when enabled)
//! 5. approval deadline sweep (server, every step)
//!
//! Time is kept as a [`Duration`] so interval and timeout comparisons are
//! exact.

use std::time::Duration;

use tracing::{debug, warn};

use super::channel::TIME_SYNC_CHANNEL;
use super::config::{NetworkConfig, TIME_SYNC_INTERVAL};
use super::message::{frame_kind, MessageKind, TimeSync};
use super::session::{ClientState, Role, Session};
use super::transport::{ClientId, NetEvent};

/// Back-to-back receive errors after which a receive phase gives up.
pub const MAX_CONSECUTIVE_RECEIVE_ERRORS: u32 = 16;

/// Interval for a phase rate; `None` runs the phase every step.
pub fn interval_for(rate: f64) -> Option<Duration> {
    if !rate.is_finite() || rate <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / rate).ok()
}

/// Phase scheduler.
#[derive(Debug, Clone)]
pub struct TickPump {
    send_interval: Option<Duration>,
    receive_interval: Option<Duration>,
    event_interval: Option<Duration>,
    last_send: Duration,
    last_receive: Duration,
    last_event: Duration,
    event_overshoot: Duration,
    last_time_sync: Duration,
}

impl TickPump {
    /// Scheduler for the given phase rates (per second).
    pub fn new(send_rate: f64, receive_rate: f64, event_rate: f64) -> Self {
        Self {
            send_interval: interval_for(send_rate),
            receive_interval: interval_for(receive_rate),
            event_interval: interval_for(event_rate),
            last_send: Duration::ZERO,
            last_receive: Duration::ZERO,
            last_event: Duration::ZERO,
            event_overshoot: Duration::ZERO,
            last_time_sync: Duration::ZERO,
        }
    }

    /// Scheduler for a configuration.
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(
            config.send_tick_rate,
            config.receive_tick_rate,
            config.event_tick_rate,
        )
    }

    /// Restart every phase from `now`, e.g. after the clock was synced.
    pub fn rebase(&mut self, now: Duration) {
        self.last_send = now;
        self.last_receive = now;
        self.last_event = now;
        self.event_overshoot = Duration::ZERO;
        self.last_time_sync = now;
    }

    fn due(last: &mut Duration, interval: Option<Duration>, now: Duration) -> bool {
        match interval {
            None => {
                *last = now;
                true
            }
            Some(interval) if now.saturating_sub(*last) >= interval => {
                *last = now;
                true
            }
            Some(_) => false,
        }
    }

    /// Whether the send phase runs at `now`.
    pub fn send_due(&mut self, now: Duration) -> bool {
        Self::due(&mut self.last_send, self.send_interval, now)
    }

    /// Whether the receive phase runs at `now`.
    pub fn receive_due(&mut self, now: Duration) -> bool {
        Self::due(&mut self.last_receive, self.receive_interval, now)
    }

    /// Whether a server event tick runs at `now`.
    ///
    /// Time past a full interval is banked; once a whole interval has been
    /// banked, a step that is otherwise not due runs a catch-up tick.
    pub fn event_due(&mut self, now: Duration) -> bool {
        let Some(interval) = self.event_interval else {
            self.last_event = now;
            return true;
        };
        let elapsed = now.saturating_sub(self.last_event);
        if elapsed >= interval {
            self.event_overshoot += elapsed - interval;
            self.last_event = now;
            true
        } else if self.event_overshoot >= interval {
            self.event_overshoot -= interval;
            true
        } else {
            false
        }
    }

    /// Whether a time sync broadcast is due at `now`.
    pub fn time_sync_due(&mut self, now: Duration) -> bool {
        Self::due(&mut self.last_time_sync, Some(TIME_SYNC_INTERVAL), now)
    }

    /// Banked event time.
    pub fn event_overshoot(&self) -> Duration {
        self.event_overshoot
    }
}

impl Session {
    /// Advance the session by one simulation step.
    pub fn tick(&mut self, delta: Duration) {
        if self.role.is_none() {
            return;
        }
        self.network_time += delta;
        let now = self.network_time;

        if self.pump.send_due(now) {
            self.send_phase();
        }
        if self.pump.receive_due(now) {
            self.receive_phase();
        }
        if !self.is_server() {
            return;
        }

        if self.pump.event_due(now) {
            self.stats.event_ticks += 1;
            self.world.on_event_tick(now);
        }
        if self.config.enable_time_resync && self.pump.time_sync_due(now) {
            self.send_time_sync();
        }
        self.sweep_deadlines();
    }

    fn send_phase(&mut self) {
        let Some(role) = self.role else {
            return;
        };
        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        if role.is_server() {
            let host = transport.host_dummy_id();
            for id in self.clients.keys().copied().filter(|id| *id != host) {
                if let Err(e) = transport.send_queue(id) {
                    warn!("Flush to {} failed: {}", id, e);
                }
            }
        } else if role == Role::Client && self.state != ClientState::Disconnected {
            let server = transport.server_client_id();
            if let Err(e) = transport.send_queue(server) {
                warn!("Flush to server failed: {}", e);
            }
        }
    }

    fn receive_phase(&mut self) {
        // Host loopback first, in the order it was queued.
        let local: Vec<_> = self.loopback.drain(..).collect();
        for (channel, bytes) in local {
            self.handle_data(ClientId::HOST, channel, &bytes);
        }

        let cap = self.config.max_receive_events_per_tick as usize;
        let mut processed = 0usize;
        let mut failures = 0u32;
        while self.role.is_some() && (cap == 0 || processed < cap) {
            let Some(transport) = self.transport.as_mut() else {
                break;
            };
            processed += 1;
            let event = match transport.poll_receive() {
                Ok(event) => {
                    failures = 0;
                    event
                }
                Err(e) => {
                    warn!("Transport receive error: {}", e);
                    self.stats.receive_errors += 1;
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_RECEIVE_ERRORS {
                        warn!("{} receive errors in a row, ending receive phase", failures);
                        break;
                    }
                    continue;
                }
            };

            match event {
                NetEvent::Nothing => break,
                NetEvent::Connect { client } => self.on_transport_connect(client),
                NetEvent::Data {
                    client,
                    channel,
                    payload,
                } => self.handle_data(client, channel, &payload),
                NetEvent::Disconnect { client } => self.on_transport_disconnect(client),
            }
        }
    }

    fn send_time_sync(&mut self) {
        let timestamp = match self.transport.as_ref() {
            Some(transport) => transport.network_timestamp(),
            None => return,
        };
        let sync = TimeSync {
            time: self.network_time.as_secs_f32(),
            timestamp,
        };
        let mut writer = frame_kind(MessageKind::TimeSync);
        sync.encode(&mut writer);
        self.queue_all(TIME_SYNC_CHANNEL, writer.as_bytes(), Some(ClientId::HOST));
        self.stats.time_syncs_sent += 1;
        debug!("Time sync at {:?}", self.network_time);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_interval_for() {
        assert_eq!(interval_for(0.0), None);
        assert_eq!(interval_for(-5.0), None);
        assert_eq!(interval_for(f64::NAN), None);
        assert_eq!(interval_for(64.0), Some(Duration::from_micros(15_625)));
    }

    #[test]
    fn test_zero_rate_runs_every_step() {
        let mut pump = TickPump::new(0.0, 0.0, 0.0);
        for step in 0..5 {
            let now = ms(step);
            assert!(pump.send_due(now));
            assert!(pump.receive_due(now));
            assert!(pump.event_due(now));
        }
    }

    #[test]
    fn test_rate_limited_phase() {
        let mut pump = TickPump::new(10.0, 0.0, 0.0);
        assert!(!pump.send_due(ms(50)));
        assert!(pump.send_due(ms(100)));
        assert!(!pump.send_due(ms(150)));
        assert!(pump.send_due(ms(210)));
    }

    #[test]
    fn test_event_overshoot_catch_up() {
        let mut pump = TickPump::new(0.0, 0.0, 10.0);

        assert!(pump.event_due(ms(150)));
        assert_eq!(pump.event_overshoot(), ms(50));

        assert!(pump.event_due(ms(260)));
        assert_eq!(pump.event_overshoot(), ms(60));

        assert!(!pump.event_due(ms(300)));

        assert!(pump.event_due(ms(410)));
        assert_eq!(pump.event_overshoot(), ms(110));

        // Not due by elapsed time, but a full interval is banked.
        assert!(pump.event_due(ms(420)));
        assert_eq!(pump.event_overshoot(), ms(10));

        assert!(!pump.event_due(ms(430)));
    }

    #[test]
    fn test_time_sync_every_thirty_seconds() {
        let mut pump = TickPump::new(0.0, 0.0, 0.0);
        assert!(!pump.time_sync_due(Duration::from_secs(29)));
        assert!(pump.time_sync_due(Duration::from_secs(30)));
        assert!(!pump.time_sync_due(Duration::from_secs(59)));
        assert!(pump.time_sync_due(Duration::from_secs(60)));
    }

    #[test]
    fn test_rebase_after_clock_jump_back() {
        let mut pump = TickPump::new(10.0, 10.0, 10.0);
        assert!(pump.send_due(ms(1000)));
        // Clock synced to an earlier server time.
        pump.rebase(ms(400));
        assert!(!pump.send_due(ms(450)));
        assert!(pump.send_due(ms(500)));
    }
}
