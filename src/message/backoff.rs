use std::{iter::Take, time::Duration};

/// Provides a mechanism for attempting to complete an operation and
/// retrying the operation, with a backoff, if it fails.
///
/// This iterator provides an infinite stream of back off durations, where
/// the duration increases by an exponential factor up to some maximum delay.
/// Upon reaching the maximum delay, that value will be returned from then
/// on. Use [Iterator::take] to bound the number of attempts.
///
/// The [Retry] trait uses [std::thread::sleep] for the delay; so do NOT use
/// this with asynchronous code.
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
        let new_next = self.curr * self.factor;

        self.curr = if new_next > self.max {
            self.max
        } else {
            new_next
        };

        Some(this)
    }
}

/// The Retry trait provides a protocol for retrying a function that returns
/// a [Result] until either it succeeds or the [Iterator] of delays runs out.
pub trait Retry {
    /// Retry the given function until it returns [Ok]. After every failed
    /// attempt except the last, `sleep` is given the error and the delay to
    /// wait before the next attempt. If the [Iterator] finishes without a
    /// successful execution of `f` then the last [Err] is returned. `None` is
    /// returned only if the iterator was empty to begin with.
    fn retry<F, S, T, E>(&mut self, mut f: F, sleep: S) -> Option<Result<T, E>>
    where
        F: FnMut() -> Result<T, E>,
        S: Fn(&E, Duration),
        Self: Iterator<Item = Duration> + Sized,
    {
        let mut last_err = None;
        let mut iter = self.peekable();
        while let Some(delay) = iter.next() {
            match f() {
                Ok(v) => return Some(Ok(v)),
                Err(e) => {
                    if iter.peek().is_some() {
                        sleep(&e, delay);
                    }
                    last_err = Some(Err(e));
                }
            }
        }
        last_err
    }
}

impl Retry for ExponentialBackoff {}

impl Retry for Take<ExponentialBackoff> {}
