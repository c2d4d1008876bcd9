//! Ping/pong liveness checks.
//!
//! While connected, a `ping` is due every `interval`. Each ping arms a pong
//! deadline unless one is already pending; a `pong` disarms it. The engine
//! sleeps on [`Heartbeat::next_ping`] and [`Heartbeat::pong_deadline`].

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub(crate) struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    next_ping: Option<Instant>,
    pong_deadline: Option<Instant>,
}

impl Heartbeat {
    pub(crate) fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            next_ping: None,
            pong_deadline: None,
        }
    }

    /// Schedule the first ping one interval from `now`.
    pub(crate) fn start(&mut self, now: Instant) {
        self.next_ping = Some(now + self.interval);
        self.pong_deadline = None;
    }

    /// Cancel both timers.
    pub(crate) fn stop(&mut self) {
        self.next_ping = None;
        self.pong_deadline = None;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.next_ping.is_some()
    }

    pub(crate) fn next_ping(&self) -> Option<Instant> {
        self.next_ping
    }

    pub(crate) fn pong_deadline(&self) -> Option<Instant> {
        self.pong_deadline
    }

    /// The ping interval fired. Schedules the next one.
    pub(crate) fn interval_elapsed(&mut self, now: Instant) {
        if self.next_ping.is_some() {
            self.next_ping = Some(now + self.interval);
        }
    }

    /// A ping was written. Arms the pong deadline if none is pending.
    pub(crate) fn ping_sent(&mut self, now: Instant) {
        if self.pong_deadline.is_none() {
            self.pong_deadline = Some(now + self.timeout);
        }
    }

    /// A pong arrived.
    pub(crate) fn on_pong(&mut self) {
        self.pong_deadline = None;
    }
}
