use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Cancellation handle plumbed into every public call,
///
/// Carries an explicit cancel signal and an optional deadline. Implementations
/// check it between retries, between chunks, and inside body readers.
///
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Returns a context that is never canceled,
    ///
    pub fn background() -> Self {
        Context {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Returns a derived context that expires after the timeout, chainable
    ///
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Context {
            token: self.token.child_token(),
            deadline: Some(
                self.deadline
                    .map(|d| d.min(Instant::now() + timeout))
                    .unwrap_or_else(|| Instant::now() + timeout),
            ),
        }
    }

    /// Returns a derived context plus the token that cancels it,
    ///
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = self.token.child_token();
        (
            Context {
                token: token.clone(),
                deadline: self.deadline,
            },
            token,
        )
    }

    /// Returns an error when the context has been canceled or its deadline passed,
    ///
    pub fn err(&self) -> Result<(), Error> {
        if self.token.is_cancelled() {
            return Err(Error::canceled());
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::canceled());
            }
        }
        Ok(())
    }

    /// Drives a future to completion unless the context fires first,
    ///
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = T>,
    {
        self.err()?;
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Err(Error::canceled()),
                _ = tokio::time::sleep_until(deadline) => Err(Error::canceled()),
                out = fut => Ok(out),
            },
            None => tokio::select! {
                _ = self.token.cancelled() => Err(Error::canceled()),
                out = fut => Ok(out),
            },
        }
    }

    /// Sleeps for the duration, waking early with an error when canceled,
    ///
    pub async fn sleep(&self, duration: Duration) -> Result<(), Error> {
        self.run(tokio::time::sleep(duration)).await
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
