//! # timer
//!
//! why: raft needs a randomized election timeout and a steady heartbeat without owning a clock
//! relations: feeds Event::ElectionTimeout / Event::Heartbeat into the worker; the worker resets it through Notify
//! what: run_timer task

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::trace;

use crate::worker::Event;

#[derive(Debug, Clone, Copy)]
pub struct TimerSettings {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
}

impl TimerSettings {
    fn election_deadline(&self) -> Instant {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        let timeout = rand::thread_rng().gen_range(min..=max.max(min));
        Instant::now() + Duration::from_millis(timeout)
    }
}

/// Drive the worker's clock until shutdown.
///
/// Ticks are dropped rather than queued when the worker is behind.
pub async fn run_timer(
    settings: TimerSettings,
    events: mpsc::Sender<Event>,
    reset: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut heartbeat = interval(settings.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut deadline = settings.election_deadline();

    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return,
            _ = reset.notified() => {
                deadline = settings.election_deadline();
                continue;
            }
            _ = sleep_until(deadline) => {
                deadline = settings.election_deadline();
                Event::ElectionTimeout
            }
            _ = heartbeat.tick() => Event::Heartbeat,
        };
        match events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => trace!(?event, "worker busy, tick dropped"),
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}
