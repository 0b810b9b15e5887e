//! Idle detection for connection liveness
//!
//! Three independent timers watch a connection: read-idle, write-idle and
//! all-idle. Each timer fires once per idle period and then re-arms for a full
//! period measured from the later of its last firing and the last activity.
//! The session decides what an event means (read-idle sends a ping, the other
//! two are advisory).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// Heartbeat configuration
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    /// Send a ping after this long without inbound traffic
    pub read_idle: Option<Duration>,
    /// Advisory: nothing written for this long
    pub write_idle: Option<Duration>,
    /// Advisory: nothing read or written for this long
    pub all_idle: Option<Duration>,
    /// Close the connection after this many unanswered pings (`None` never closes)
    pub max_missed_pings: Option<u32>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            read_idle: Some(Duration::from_secs(30)),
            write_idle: None,
            all_idle: None,
            max_missed_pings: Some(3),
        }
    }
}

impl HeartbeatConfig {
    /// No timers at all
    pub fn disabled() -> Self {
        Self {
            read_idle: None,
            write_idle: None,
            all_idle: None,
            max_missed_pings: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.read_idle.is_some() || self.write_idle.is_some() || self.all_idle.is_some()
    }
}

/// Idle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    ReaderIdle,
    WriterIdle,
    AllIdle,
}

/// Last read/write instants of one connection, shared between its tasks
#[derive(Debug)]
pub struct ActivityClock {
    base: Instant,
    last_read: AtomicU64,
    last_write: AtomicU64,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_read: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
        }
    }

    fn offset_now(&self) -> u64 {
        Instant::now().saturating_duration_since(self.base).as_nanos() as u64
    }

    fn instant_at(&self, offset: u64) -> Instant {
        self.base + Duration::from_nanos(offset)
    }

    pub fn record_read(&self) {
        self.last_read.fetch_max(self.offset_now(), Ordering::AcqRel);
    }

    pub fn record_write(&self) {
        self.last_write.fetch_max(self.offset_now(), Ordering::AcqRel);
    }

    pub fn last_read(&self) -> Instant {
        self.instant_at(self.last_read.load(Ordering::Acquire))
    }

    pub fn last_write(&self) -> Instant {
        self.instant_at(self.last_write.load(Ordering::Acquire))
    }

    pub fn last_activity(&self) -> Instant {
        self.last_read().max(self.last_write())
    }
}

#[derive(Debug)]
struct IdleTimer {
    event: IdleEvent,
    period: Duration,
    last_fired: Option<Instant>,
}

impl IdleTimer {
    fn new(event: IdleEvent, period: Option<Duration>) -> Option<Self> {
        period.map(|period| Self {
            event,
            period,
            last_fired: None,
        })
    }

    fn deadline(&self, clock: &ActivityClock) -> Instant {
        let activity = match self.event {
            IdleEvent::ReaderIdle => clock.last_read(),
            IdleEvent::WriterIdle => clock.last_write(),
            IdleEvent::AllIdle => clock.last_activity(),
        };
        let armed_from = match self.last_fired {
            Some(fired) => activity.max(fired),
            None => activity,
        };
        armed_from + self.period
    }
}

/// Waits for the next idle event of one connection
#[derive(Debug)]
pub struct IdleMonitor {
    clock: Arc<ActivityClock>,
    timers: Vec<IdleTimer>,
}

impl IdleMonitor {
    pub fn new(config: &HeartbeatConfig, clock: Arc<ActivityClock>) -> Self {
        let timers = [
            IdleTimer::new(IdleEvent::ReaderIdle, config.read_idle),
            IdleTimer::new(IdleEvent::WriterIdle, config.write_idle),
            IdleTimer::new(IdleEvent::AllIdle, config.all_idle),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self { clock, timers }
    }

    pub fn clock(&self) -> &Arc<ActivityClock> {
        &self.clock
    }

    /// Wait for the next idle event.
    ///
    /// Never resolves when no timer is configured. Cancel safe: dropping the
    /// future before it resolves leaves every timer armed as it was.
    pub async fn next_event(&mut self) -> IdleEvent {
        if self.timers.is_empty() {
            return std::future::pending().await;
        }

        loop {
            let (index, deadline) = self
                .timers
                .iter()
                .enumerate()
                .map(|(i, timer)| (i, timer.deadline(&self.clock)))
                .min_by_key(|(_, deadline)| *deadline)
                .unwrap_or_else(|| (0, Instant::now()));

            sleep_until(deadline).await;

            // Activity may have moved the deadline while sleeping
            let timer = &mut self.timers[index];
            let now = Instant::now();
            if timer.deadline(&self.clock) <= now {
                timer.last_fired = Some(now);
                return timer.event;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    fn read_only(secs: u64) -> HeartbeatConfig {
        HeartbeatConfig {
            read_idle: Some(Duration::from_secs(secs)),
            ..HeartbeatConfig::disabled()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_idle_fires_once_per_period() {
        let clock = Arc::new(ActivityClock::new());
        let mut monitor = IdleMonitor::new(&read_only(10), clock);
        let start = Instant::now();

        assert_eq!(monitor.next_event().await, IdleEvent::ReaderIdle);
        assert_eq!(start.elapsed(), Duration::from_secs(10));

        // No second event inside the re-armed period
        let early = timeout(Duration::from_millis(9_900), monitor.next_event()).await;
        assert!(early.is_err());

        assert_eq!(monitor.next_event().await, IdleEvent::ReaderIdle);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_activity_postpones_event() {
        let clock = Arc::new(ActivityClock::new());
        let mut monitor = IdleMonitor::new(&read_only(10), clock.clone());
        let start = Instant::now();

        advance(Duration::from_secs(6)).await;
        clock.record_read();

        assert_eq!(monitor.next_event().await, IdleEvent::ReaderIdle);
        assert_eq!(start.elapsed(), Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_activity_does_not_reset_reader_idle() {
        let clock = Arc::new(ActivityClock::new());
        let config = HeartbeatConfig {
            read_idle: Some(Duration::from_secs(10)),
            write_idle: Some(Duration::from_secs(4)),
            ..HeartbeatConfig::disabled()
        };
        let mut monitor = IdleMonitor::new(&config, clock.clone());
        let start = Instant::now();

        assert_eq!(monitor.next_event().await, IdleEvent::WriterIdle);
        assert_eq!(start.elapsed(), Duration::from_secs(4));

        clock.record_write();
        assert_eq!(monitor.next_event().await, IdleEvent::WriterIdle);
        assert_eq!(start.elapsed(), Duration::from_secs(8));

        clock.record_write();
        assert_eq!(monitor.next_event().await, IdleEvent::ReaderIdle);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_monitor_never_fires() {
        let clock = Arc::new(ActivityClock::new());
        let mut monitor = IdleMonitor::new(&HeartbeatConfig::disabled(), clock);

        let res = timeout(Duration::from_secs(3600), monitor.next_event()).await;
        assert!(res.is_err());
    }

    #[test]
    fn test_default_config() {
        let config = HeartbeatConfig::default();
        assert!(config.is_enabled());
        assert_eq!(config.max_missed_pings, Some(3));
        assert!(!HeartbeatConfig::disabled().is_enabled());
    }
}
