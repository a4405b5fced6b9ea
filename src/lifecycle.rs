use crate::errors::Result;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Start/stop contract shared by single services, groups and test doubles.
pub trait Lifecycle: Send {
    /// Start and block until ready, or fail within `timeout`.
    fn start(&mut self, timeout: Duration) -> Result<()>;

    /// Stop and block until gone. `None` waits without a deadline.
    fn stop(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Short label used in logs and group errors
    fn name(&self) -> String {
        "service".to_string()
    }

    /// Start and hand back a guard that stops on every exit path.
    ///
    /// `stop_timeout` bounds the stop performed when the guard goes out of
    /// scope.
    fn start_scoped(
        &mut self,
        timeout: Duration,
        stop_timeout: Duration,
    ) -> Result<Scoped<'_, Self>>
    where
        Self: Sized,
    {
        self.start(timeout)?;
        Ok(Scoped {
            inner: self,
            stop_timeout,
            finished: false,
        })
    }
}

impl<L: Lifecycle + ?Sized> Lifecycle for Box<L> {
    fn start(&mut self, timeout: Duration) -> Result<()> {
        (**self).start(timeout)
    }

    fn stop(&mut self, timeout: Option<Duration>) -> Result<()> {
        (**self).stop(timeout)
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

/// A started service that is stopped when this guard is dropped.
///
/// Errors from the implicit stop are logged; call [`Scoped::finish`] to get
/// them instead.
#[must_use = "dropping the guard stops the service immediately"]
pub struct Scoped<'a, L: Lifecycle> {
    inner: &'a mut L,
    stop_timeout: Duration,
    finished: bool,
}

impl<L: Lifecycle> Scoped<'_, L> {
    /// Stop now and report the outcome
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.inner.stop(Some(self.stop_timeout))
    }
}

impl<L: Lifecycle> Deref for Scoped<'_, L> {
    type Target = L;

    fn deref(&self) -> &L {
        self.inner
    }
}

impl<L: Lifecycle> DerefMut for Scoped<'_, L> {
    fn deref_mut(&mut self) -> &mut L {
        self.inner
    }
}

impl<L: Lifecycle> Drop for Scoped<'_, L> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.inner.stop(Some(self.stop_timeout)) {
            tracing::warn!(service = %self.inner.name(), error = %e, "failed to stop scoped service");
        }
    }
}
