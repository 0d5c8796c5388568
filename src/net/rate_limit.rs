//! Send shaping, inbound throttling and log throttling
//!
//! All limiters take the current `Instant` explicitly (`*_at`) so the
//! session can share one clock reading across checks and tests can drive
//! them deterministically.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const ONE_SEC: Duration = Duration::from_secs(1);
const TEN_SECS: Duration = Duration::from_secs(10);

/// Soft outbound shaping: two sends closer than `trigger` make the second
/// one wait `sleep`. Never drops anything.
#[derive(Debug, Clone)]
pub struct OutboundThrottle {
    trigger: Duration,
    sleep: Duration,
    last_send: Option<Instant>,
}

impl OutboundThrottle {
    pub fn new(trigger: Duration, sleep: Duration) -> Self {
        Self {
            trigger,
            sleep,
            last_send: None,
        }
    }

    /// Delay the caller must wait before writing.
    /// The send is booked at the time it will actually leave, so a burst of
    /// sends is spaced by `sleep` each.
    pub fn reserve_at(&mut self, now: Instant) -> Duration {
        let delay = match self.last_send {
            // A concurrent caller is still waiting for its slot
            Some(last) if last > now => (last - now) + self.sleep,
            Some(last) if now.saturating_duration_since(last) < self.trigger => self.sleep,
            _ => Duration::ZERO,
        };
        self.last_send = Some(now + delay);
        delay
    }

    pub fn reserve(&mut self) -> Duration {
        self.reserve_at(Instant::now())
    }
}

/// Sliding window over inbound arrival times with a 1 s and a 10 s ceiling
#[derive(Debug, Clone)]
pub struct InboundThrottle {
    per_sec: usize,
    per_10_sec: usize,
    window: VecDeque<Instant>,
}

impl InboundThrottle {
    pub fn new(per_sec: usize, per_10_sec: usize) -> Self {
        Self {
            per_sec,
            per_10_sec,
            window: VecDeque::with_capacity(per_10_sec.min(4096) + 1),
        }
    }

    /// Record one arrival. Returns true when a ceiling is exceeded.
    /// The window is cleared on a breach, so one excess batch yields one
    /// report rather than one per message.
    pub fn record_at(&mut self, now: Instant) -> bool {
        while let Some(front) = self.window.front() {
            if now.saturating_duration_since(*front) >= TEN_SECS {
                self.window.pop_front();
            } else {
                break;
            }
        }
        self.window.push_back(now);

        let last_10_sec = self.window.len();
        let last_sec = self
            .window
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) < ONE_SEC)
            .count();

        let exceeded = last_sec > self.per_sec || last_10_sec > self.per_10_sec;
        if exceeded {
            self.window.clear();
        }
        exceeded
    }

    pub fn record(&mut self) -> bool {
        self.record_at(Instant::now())
    }

    /// Arrivals currently in the window
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

/// Shock absorber on the read loop: two arrivals closer than `trigger`
/// pause reading for `sleep`. Independent of the ceilings above.
#[derive(Debug, Clone)]
pub struct SpacingThrottle {
    trigger: Duration,
    sleep: Duration,
    last: Option<Instant>,
}

impl SpacingThrottle {
    pub fn new(trigger: Duration, sleep: Duration) -> Self {
        Self {
            trigger,
            sleep,
            last: None,
        }
    }

    pub fn delay_at(&mut self, now: Instant) -> Duration {
        let delay = match self.last {
            Some(last) if now.saturating_duration_since(last) < self.trigger => self.sleep,
            _ => Duration::ZERO,
        };
        self.last = Some(now);
        delay
    }

    pub fn delay(&mut self) -> Duration {
        self.delay_at(Instant::now())
    }
}

#[derive(Debug, Default)]
struct LogThrottleState {
    last_emit: Option<Instant>,
    suppressed: u64,
}

/// At most one detailed log line per interval for one diagnostic category.
/// Only gates logging, never the decisions being logged.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    state: Mutex<LogThrottleState>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(LogThrottleState::default()),
        }
    }

    /// `Some(suppressed)` when the caller should emit, carrying how many
    /// events were swallowed since the previous emission
    pub fn permit_at(&self, now: Instant) -> Option<u64> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let due = match state.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            state.last_emit = Some(now);
            Some(std::mem::take(&mut state.suppressed))
        } else {
            state.suppressed = state.suppressed.saturating_add(1);
            None
        }
    }

    pub fn permit(&self) -> Option<u64> {
        self.permit_at(Instant::now())
    }
}
