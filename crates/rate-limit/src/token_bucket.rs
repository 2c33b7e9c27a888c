use std::time::Duration;

use diagd_common::{DiagError, DiagResult};

use crate::clock::{duration_millis, Timestamp};

/// A single token bucket.
///
/// The bucket holds up to `capacity` tokens and regains one token every
/// `period`. Refills happen in whole periods only: `last_refill` is advanced by
/// a multiple of `period` rather than jumping to "now", so partial progress
/// towards the next token survives irregular check intervals.
///
/// The bucket itself is plain data; callers that share it between threads wrap
/// it in a lock so that refill and consume happen as one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucket {
    capacity: u32,
    period: Duration,
    tokens: u32,
    last_refill: Timestamp,
}

impl TokenBucket {
    /// Create a full bucket whose refill phase starts at `now`.
    ///
    /// `period` is kept at millisecond resolution; anything shorter than one
    /// millisecond is rejected along with a zero capacity.
    pub fn new(capacity: u32, period: Duration, now: Timestamp) -> DiagResult<Self> {
        let period = validate_limits(capacity, period)?;
        Ok(Self {
            capacity,
            period,
            tokens: capacity,
            last_refill: now,
        })
    }

    /// Rebuild a bucket from previously captured state.
    pub fn from_parts(
        capacity: u32,
        period: Duration,
        tokens: u32,
        last_refill: Timestamp,
    ) -> DiagResult<Self> {
        let period = validate_limits(capacity, period)?;
        if tokens > capacity {
            return Err(DiagError::invalid(format!(
                "tokens ({}) exceed capacity ({})",
                tokens, capacity
            )));
        }
        Ok(Self {
            capacity,
            period,
            tokens,
            last_refill,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Tokens currently in the bucket, without applying any pending refill.
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn last_refill(&self) -> Timestamp {
        self.last_refill
    }

    pub fn is_full(&self) -> bool {
        self.tokens == self.capacity
    }

    fn period_ms(&self) -> u64 {
        duration_millis(self.period)
    }

    /// Credit every whole period that has elapsed since the last refill.
    ///
    /// If `now` is earlier than the last refill (the wall clock was stepped
    /// back), the phase is re-anchored at `now` and the token count is left
    /// alone.
    pub fn refill(&mut self, now: Timestamp) {
        let Some(elapsed) = now.checked_since(self.last_refill) else {
            tracing::debug!(
                last_refill = %self.last_refill,
                now = %now,
                "clock moved backwards, re-anchoring bucket phase"
            );
            self.last_refill = now;
            return;
        };

        let period_ms = self.period_ms();
        let periods = duration_millis(elapsed) / period_ms;
        if periods == 0 {
            return;
        }

        let credit = u32::try_from(periods).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(credit).min(self.capacity);
        // periods * period_ms <= elapsed, so this cannot overflow past `now`.
        self.last_refill = Timestamp::from_millis(self.last_refill.as_millis() + periods * period_ms);
    }

    /// Refill, then take `n` tokens if they are all available.
    ///
    /// Returns `Ok(false)` and leaves the token count untouched when fewer
    /// than `n` tokens are present. `n == 0` is an invalid argument.
    pub fn try_consume(&mut self, n: u32, now: Timestamp) -> DiagResult<bool> {
        if n == 0 {
            return Err(DiagError::invalid("token count must be > 0"));
        }

        self.refill(now);

        if self.tokens >= n {
            self.tokens -= n;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Change capacity and period in place, clamping tokens to the new
    /// capacity. The refill phase is kept.
    pub fn reconfigure(&mut self, capacity: u32, period: Duration) -> DiagResult<()> {
        self.period = validate_limits(capacity, period)?;
        self.capacity = capacity;
        self.tokens = self.tokens.min(capacity);
        Ok(())
    }

    /// Top the bucket up and restart its phase at `now`.
    pub fn reset(&mut self, now: Timestamp) {
        self.tokens = self.capacity;
        self.last_refill = now;
    }

    /// How long until `n` tokens will be available, or `None` if `n` can
    /// never be satisfied by this bucket.
    pub fn time_until_available(&self, n: u32, now: Timestamp) -> Option<Duration> {
        if n > self.capacity {
            return None;
        }

        let mut projected = self.clone();
        projected.refill(now);
        if projected.tokens >= n {
            return Some(Duration::ZERO);
        }

        let missing = u64::from(n - projected.tokens);
        let into_period = now
            .checked_since(projected.last_refill)
            .map(duration_millis)
            .unwrap_or(0);
        let wait_ms = missing
            .saturating_mul(projected.period_ms())
            .saturating_sub(into_period);
        Some(Duration::from_millis(wait_ms))
    }
}

/// Check capacity and period, returning the period truncated to whole
/// milliseconds.
pub(crate) fn validate_limits(capacity: u32, period: Duration) -> DiagResult<Duration> {
    if capacity == 0 {
        return Err(DiagError::invalid("capacity must be > 0"));
    }
    let period_ms = duration_millis(period);
    if period_ms == 0 {
        return Err(DiagError::invalid(format!(
            "period must be at least 1ms, got {:?}",
            period
        )));
    }
    Ok(Duration::from_millis(period_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn new_bucket_is_full() {
        let bucket = TokenBucket::new(3, Duration::from_secs(1), at(0)).unwrap();
        assert_eq!(bucket.tokens(), 3);
        assert!(bucket.is_full());
        assert_eq!(bucket.last_refill(), at(0));
    }

    #[test]
    fn rejects_invalid_limits() {
        assert!(matches!(
            TokenBucket::new(0, Duration::from_secs(1), at(0)),
            Err(DiagError::InvalidArgument(_))
        ));
        assert!(matches!(
            TokenBucket::new(1, Duration::ZERO, at(0)),
            Err(DiagError::InvalidArgument(_))
        ));
        // Sub-millisecond periods would truncate to zero.
        assert!(TokenBucket::new(1, Duration::from_micros(999), at(0)).is_err());
        assert!(TokenBucket::from_parts(2, Duration::from_secs(1), 3, at(0)).is_err());
    }

    #[test]
    fn consume_succeeds_only_with_enough_tokens() {
        let mut bucket = TokenBucket::new(3, Duration::from_secs(1), at(0)).unwrap();

        assert!(bucket.try_consume(2, at(0)).unwrap());
        assert_eq!(bucket.tokens(), 1);

        // Not enough: nothing is taken.
        assert!(!bucket.try_consume(2, at(0)).unwrap());
        assert_eq!(bucket.tokens(), 1);

        assert!(bucket.try_consume(1, at(0)).unwrap());
        assert_eq!(bucket.tokens(), 0);
        assert!(!bucket.try_consume(1, at(0)).unwrap());
    }

    #[test]
    fn zero_count_is_invalid() {
        let mut bucket = TokenBucket::new(3, Duration::from_secs(1), at(0)).unwrap();
        assert!(matches!(
            bucket.try_consume(0, at(0)),
            Err(DiagError::InvalidArgument(_))
        ));
        assert_eq!(bucket.tokens(), 3);
    }

    #[test]
    fn count_above_capacity_never_succeeds() {
        let mut bucket = TokenBucket::new(2, Duration::from_millis(10), at(0)).unwrap();
        assert!(!bucket.try_consume(3, at(1_000_000)).unwrap());
        assert_eq!(bucket.tokens(), 2);
        assert_eq!(bucket.time_until_available(3, at(0)), None);
    }

    #[test]
    fn refill_credits_whole_periods_only() {
        let mut bucket = TokenBucket::from_parts(10, Duration::from_millis(100), 0, at(0)).unwrap();

        // k = 3, r = 50
        bucket.refill(at(350));
        assert_eq!(bucket.tokens(), 3);
        assert_eq!(bucket.last_refill(), at(300));

        bucket.refill(at(399));
        assert_eq!(bucket.tokens(), 3);

        // The 50ms carried over counts toward the next token.
        bucket.refill(at(400));
        assert_eq!(bucket.tokens(), 4);
        assert_eq!(bucket.last_refill(), at(400));
    }

    #[test]
    fn irregular_checks_do_not_drift() {
        let period = Duration::from_millis(100);
        let mut checked = TokenBucket::from_parts(50, period, 0, at(0)).unwrap();
        let mut idle = checked.clone();

        for t in [30, 130, 170, 260, 299, 410, 555, 640, 777, 901, 1_000] {
            checked.refill(at(t));
        }
        idle.refill(at(1_000));

        assert_eq!(checked, idle);
        assert_eq!(checked.tokens(), 10);
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::from_parts(3, Duration::from_millis(10), 1, at(0)).unwrap();
        bucket.refill(at(10_000));
        assert_eq!(bucket.tokens(), 3);
        assert_eq!(bucket.last_refill(), at(10_000));
    }

    #[test]
    fn backwards_clock_reanchors_phase() {
        let mut bucket = TokenBucket::from_parts(3, Duration::from_secs(1), 1, at(5_000)).unwrap();
        bucket.refill(at(2_000));
        assert_eq!(bucket.tokens(), 1);
        assert_eq!(bucket.last_refill(), at(2_000));

        bucket.refill(at(3_000));
        assert_eq!(bucket.tokens(), 2);
    }

    #[test]
    fn reconfigure_clamps_tokens() {
        let mut bucket = TokenBucket::new(5, Duration::from_secs(1), at(0)).unwrap();
        bucket.reconfigure(2, Duration::from_secs(10)).unwrap();
        assert_eq!(bucket.capacity(), 2);
        assert_eq!(bucket.tokens(), 2);
        assert_eq!(bucket.period(), Duration::from_secs(10));

        assert!(bucket.reconfigure(0, Duration::from_secs(1)).is_err());
        assert_eq!(bucket.capacity(), 2);
    }

    #[test]
    fn reset_tops_up() {
        let mut bucket = TokenBucket::from_parts(4, Duration::from_secs(1), 0, at(0)).unwrap();
        bucket.reset(at(500));
        assert!(bucket.is_full());
        assert_eq!(bucket.last_refill(), at(500));
    }

    #[test]
    fn time_until_available_accounts_for_partial_period() {
        let bucket = TokenBucket::from_parts(3, Duration::from_millis(100), 0, at(0)).unwrap();
        assert_eq!(
            bucket.time_until_available(1, at(40)),
            Some(Duration::from_millis(60))
        );
        assert_eq!(
            bucket.time_until_available(2, at(40)),
            Some(Duration::from_millis(160))
        );
        assert_eq!(bucket.time_until_available(1, at(100)), Some(Duration::ZERO));
    }

    #[test]
    fn time_until_available_saturates_for_huge_periods() {
        let bucket = TokenBucket::from_parts(3, Duration::MAX, 0, at(0)).unwrap();
        assert_eq!(
            bucket.time_until_available(3, at(10)),
            Some(Duration::from_millis(u64::MAX - 10))
        );
    }
}
