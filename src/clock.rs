use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use tracing::warn;

use crate::Result;

/// Source of wall-clock readings, as time since the UNIX epoch.
pub trait Clock: Send {
    fn now(&self) -> Result<Duration>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Result<Duration> {
        let dura = SystemTime::now().duration_since(UNIX_EPOCH)?;
        Ok(dura)
    }
}

/// Hands out capture timestamps that never go backwards, whatever the
/// underlying clock does.
pub struct CaptureClock {
    source: Box<dyn Clock>,
    last: Option<Duration>,
}

impl CaptureClock {
    pub fn new(source: Box<dyn Clock>) -> CaptureClock {
        CaptureClock { source, last: None }
    }
    /// A fresh reading from the source, not yet clamped.
    pub fn read(&self) -> Result<Duration> {
        self.source.now()
    }
    /// Clamp `ts` to the last stamp handed out and remember it.
    pub fn stamp(&mut self, ts: Duration) -> Duration {
        let ts = match self.last {
            Some(last) if ts < last => {
                warn!(
                    behind_us = (last - ts).as_micros() as u64,
                    "clock went backwards, reusing last capture timestamp"
                );
                last
            }
            _ => ts,
        };
        self.last = Some(ts);
        ts
    }
    pub fn now(&mut self) -> Result<Duration> {
        let ts = self.read()?;
        Ok(self.stamp(ts))
    }
    pub fn last(&self) -> Option<Duration> {
        self.last
    }
}
