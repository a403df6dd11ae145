use std::time::Instant;

/// Approximate token accounting for one generation call.
#[derive(Debug, Clone)]
pub struct TokenMeter {
    started: Instant,
    total: u64,
}

impl TokenMeter {
    pub fn start() -> Self {
        Self::start_at(Instant::now())
    }

    pub fn start_at(started: Instant) -> Self {
        Self { started, total: 0 }
    }

    /// Adds `fragment` and returns the cumulative count.
    pub fn record(&mut self, fragment: &str) -> u64 {
        self.total += count_tokens(fragment);
        self.total
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn tokens_per_second(&self) -> f64 {
        self.tokens_per_second_at(Instant::now())
    }

    pub fn tokens_per_second_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.total as f64 / elapsed
    }
}

/// Whitespace-separated pieces; a non-empty fragment counts at least once.
pub fn count_tokens(fragment: &str) -> u64 {
    let pieces = fragment.split_whitespace().count() as u64;
    if pieces == 0 && !fragment.is_empty() {
        1
    } else {
        pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_count_tokens() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens(" "), 1);
        assert_eq!(count_tokens("He"), 1);
        assert_eq!(count_tokens("hello there  world"), 3);
    }

    #[test]
    fn test_meter() {
        let t0 = Instant::now();
        let mut meter = TokenMeter::start_at(t0);
        assert_eq!(meter.tokens_per_second_at(t0), 0.0);

        assert_eq!(meter.record("one two"), 2);
        assert_eq!(meter.record(""), 2);
        assert_eq!(meter.record("three four"), 4);
        assert_eq!(meter.total(), 4);
        assert_eq!(meter.tokens_per_second_at(t0 + Duration::from_secs(2)), 2.0);
    }
}
