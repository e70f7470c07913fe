use std::{fmt, future::Future};

/// Bounds how often a read-merge-write cycle is repeated after it lost an
/// optimistic-concurrency race.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 5 }
    }
}

impl RetryPolicy {
    /// A policy that runs an operation at most `attempts` times (at least
    /// once).
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Runs `op` until it succeeds, fails with an error that `is_conflict` does
/// not match, or the policy's attempts are used up. Conflicts are retried
/// immediately.
pub async fn on_conflict<F, Fut, T, E>(
    policy: RetryPolicy,
    is_conflict: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if is_conflict(&error) && attempt < policy.attempts => {
                tracing::debug!(attempt, %error, "Conflicting write, retrying");
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Conflict,
        Other,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Debug::fmt(self, f)
        }
    }

    fn is_conflict(e: &TestError) -> bool {
        *e == TestError::Conflict
    }

    #[tokio::test]
    async fn retries_conflicts() {
        let calls = &AtomicU32::new(0);
        let res = on_conflict(RetryPolicy::new(3), is_conflict, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TestError::Conflict)
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(res, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let calls = &AtomicU32::new(0);
        let res: Result<(), _> = on_conflict(RetryPolicy::new(2), is_conflict, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Conflict)
        })
        .await;
        assert_eq!(res, Err(TestError::Conflict));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let res: Result<(), _> = on_conflict(RetryPolicy::default(), is_conflict, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Other)
        })
        .await;
        assert_eq!(res, Err(TestError::Other));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0).attempts(), 1);
    }
}
