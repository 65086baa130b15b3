//! Token-bucket send pacing.
//!
//! The bucket refills continuously at the configured rate with a bounded
//! burst. `wait` debits one token per probe and sleeps off any deficit.
//! Each throttled wait also adds to a debt counter that only unused
//! supply repays, so the balance reported by `tokens` stays negative for
//! as long as demand keeps outrunning the rate, even though every
//! individual deficit has been slept off by the time `wait` returns. The
//! adaptive rate controller reads that surplus/debt signal to steer the
//! rate toward the caller's real probe speed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ScanError;

struct BucketState {
    rate: f64,
    tokens: f64,
    /// Accumulated shortfall from throttled waits. Repaid only by supply
    /// the caller leaves unused (refill overflowing the burst cap), so it
    /// persists exactly as long as demand keeps outrunning the rate.
    debt: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    state: Mutex<BucketState>,
    burst: f64,
}

impl TokenBucket {
    /// Sleep granularity while waiting for a token; keeps cancellation
    /// latency bounded.
    const POLL: Duration = Duration::from_millis(10);

    pub fn new(rate: u32) -> Self {
        // One tenth of a second of burst; at least one token so the
        // first probe never waits.
        let burst = f64::from(rate.max(10)) / 10.0;
        Self {
            state: Mutex::new(BucketState {
                rate: f64::from(rate),
                tokens: burst,
                debt: 0.0,
                last_refill: Instant::now(),
            }),
            burst,
        }
    }

    fn refill(state: &mut BucketState, burst: f64) {
        let now = Instant::now();
        let supply = now.duration_since(state.last_refill).as_secs_f64() * state.rate;
        state.last_refill = now;
        let free = burst - state.tokens;
        if supply > free {
            // The bucket is full; the leftover supply repays debt.
            state.tokens = burst;
            state.debt = (state.debt - (supply - free)).max(0.0);
        } else {
            state.tokens += supply;
        }
    }

    /// Debit one token, sleeping until the bucket catches up. Returns
    /// `ScannerClosed` as soon as `done` is observed.
    pub fn wait(&self, done: &AtomicBool) -> Result<(), ScanError> {
        let deficit = {
            let mut state = self.state.lock().unwrap();
            Self::refill(&mut state, self.burst);
            state.tokens -= 1.0;
            if state.tokens >= 0.0 {
                return Ok(());
            }
            state.debt += 1.0;
            Duration::from_secs_f64(-state.tokens / state.rate)
        };

        let deadline = Instant::now() + deficit;
        loop {
            if done.load(Ordering::Relaxed) {
                return Err(ScanError::ScannerClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(Self::POLL));
        }
    }

    /// Current balance: bucket tokens minus outstanding debt. Positive
    /// means the sender is running under the configured rate; negative
    /// means demand has been outrunning it and by how many probes.
    pub fn tokens(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        Self::refill(&mut state, self.burst);
        state.tokens - state.debt
    }

    pub fn set_rate(&self, rate: u32) {
        let mut state = self.state.lock().unwrap();
        Self::refill(&mut state, self.burst);
        state.rate = f64::from(rate.max(1));
    }

    pub fn rate(&self) -> u32 {
        self.state.lock().unwrap().rate as u32
    }
}
