//! Session start (identify) permits, shared by all connections of a process.

use std::{fmt::Debug, sync::Arc, time::Duration};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::LimiterError;

/// Acquire a permit before starting a new session.
///
/// The gateway client only depends on this trait, so the pool may live in
/// this process ([LocalSessionStartLimiter]) or behind a remote service
/// ([RemoteSessionStartLimiter](super::remote::RemoteSessionStartLimiter)).
#[async_trait::async_trait]
pub trait SessionStartLimiter: Debug + Send + Sync {
    /// Wait until a permit is granted.
    ///
    /// Dropping the returned [Permit] gives it back, the pool makes it
    /// available again `release_delay` later.
    async fn acquire(&self, release_delay: Duration) -> Result<Permit, LimiterError>;
}

#[async_trait::async_trait]
impl<T: SessionStartLimiter + ?Sized> SessionStartLimiter for Arc<T> {
    async fn acquire(&self, release_delay: Duration) -> Result<Permit, LimiterError> {
        (**self).acquire(release_delay).await
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// A granted session start permit, released on drop
pub struct Permit {
    release: Option<ReleaseFn>,
}

impl Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("released", &self.release.is_none())
            .finish()
    }
}

impl Permit {
    /// Create a permit that runs `release` once it is given back
    pub fn new<F: FnOnce() + Send + 'static>(release: F) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Give the permit back now
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.do_release();
    }
}

/// In process permit pool
#[derive(Debug, Clone)]
pub struct LocalSessionStartLimiter {
    semaphore: Arc<Semaphore>,
}

impl Default for LocalSessionStartLimiter {
    fn default() -> Self {
        Self::new(1)
    }
}

impl LocalSessionStartLimiter {
    /// Create a pool allowing `max_concurrency` session starts at the same time
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Permits that can be granted immediately
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stop granting permits, pending and future acquires fail
    pub fn close(&self) {
        self.semaphore.close();
    }
}

fn delayed_release(permit: OwnedSemaphorePermit, release_delay: Duration) {
    if release_delay.is_zero() {
        drop(permit);
        return;
    }

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(release_delay).await;
                log::trace!("Session start permit released after {:?}", release_delay);
                drop(permit);
            });
        }
        // no runtime left to wait on, release right away
        Err(_) => drop(permit),
    }
}

#[async_trait::async_trait]
impl SessionStartLimiter for LocalSessionStartLimiter {
    async fn acquire(&self, release_delay: Duration) -> Result<Permit, LimiterError> {
        log::trace!(
            "Waiting session start permit, {} available",
            self.available()
        );

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::PoolClosed)?;

        log::debug!("Session start permit granted");

        Ok(Permit::new(move || delayed_release(permit, release_delay)))
    }
}
