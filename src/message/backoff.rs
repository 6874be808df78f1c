use std::time::Duration;

/// Provides an infinite stream of back off durations, where the duration
/// increases by an exponential factor up to some maximum delay. Upon
/// reaching the maximum delay, that value will be returned from then on.
/// Use `take` to bound the number of attempts.
///
pub struct ExponentialBackoff {
    curr: Duration,
    max: Duration,
    factor: u32,
}

impl ExponentialBackoff {
    pub fn new(start: Duration, max: Duration, factor: u32) -> ExponentialBackoff {
        ExponentialBackoff {
            curr: start,
            max,
            factor,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let this = self.curr;
        self.curr = (self.curr * self.factor).min(self.max);
        Some(this)
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn delays_grow_then_saturate() {
        let delays: Vec<_> = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(50), 2)
            .take(5)
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
    }
}
