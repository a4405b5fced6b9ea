//! Concurrent start/stop of several services under one shared deadline.

use crate::config::HarnessConfig;
use crate::errors::{GroupOperation, HarnessError, MemberFailure, Result};
use crate::lifecycle::Lifecycle;
use crate::pool::WorkerPool;
use std::collections::BTreeSet;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default number of concurrently starting/stopping members
pub const DEFAULT_WORKERS: usize = 7;

type Member = Arc<Mutex<Box<dyn Lifecycle>>>;

/// A fixed set of services started and stopped together.
///
/// Members run their `start`/`stop` concurrently on a worker pool, in no
/// particular order. The timeout given to [`ServiceGroup::start`] and
/// [`ServiceGroup::stop`] is one budget for the whole group, and each member
/// also receives it as its own timeout.
///
/// When the budget runs out, members still working are left running in the
/// background; their state is unknown and they may need cleanup.
pub struct ServiceGroup {
    members: Vec<Member>,
    names: Vec<String>,
    pool: WorkerPool,
}

impl ServiceGroup {
    pub fn new<I, L>(members: I) -> Result<Self>
    where
        I: IntoIterator<Item = L>,
        L: Lifecycle + 'static,
    {
        Self::with_workers(members, DEFAULT_WORKERS)
    }

    pub fn with_workers<I, L>(members: I, workers: usize) -> Result<Self>
    where
        I: IntoIterator<Item = L>,
        L: Lifecycle + 'static,
    {
        let mut names = Vec::new();
        let members = members
            .into_iter()
            .map(|member| {
                names.push(member.name());
                Arc::new(Mutex::new(Box::new(member) as Box<dyn Lifecycle>))
            })
            .collect();

        Ok(Self {
            members,
            names,
            pool: WorkerPool::new(workers)?,
        })
    }

    pub fn from_config<I, L>(members: I, config: &HarnessConfig) -> Result<Self>
    where
        I: IntoIterator<Item = L>,
        L: Lifecycle + 'static,
    {
        Self::with_workers(members, config.group_workers)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Run `f` against one member.
    ///
    /// Blocks while that member is still inside a `start` or `stop`,
    /// including one left over from a timed-out group operation.
    pub fn with_member<R>(&self, index: usize, f: impl FnOnce(&mut dyn Lifecycle) -> R) -> Option<R> {
        let member = self.members.get(index)?;
        let mut guard = lock_member(member);
        Some(f(&mut **guard))
    }

    /// Start every member and wait until all are ready or `timeout` passes
    pub fn start(&mut self, timeout: Duration) -> Result<()> {
        self.fan_out(GroupOperation::Start, Some(timeout))
    }

    /// Stop every member and wait until all have exited or `timeout` passes
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        self.fan_out(GroupOperation::Stop, Some(timeout))
    }

    fn fan_out(&self, operation: GroupOperation, timeout: Option<Duration>) -> Result<()> {
        let started_at = Instant::now();
        let deadline = timeout.and_then(|timeout| started_at.checked_add(timeout));
        let (tx, rx) = mpsc::channel();

        for (index, member) in self.members.iter().enumerate() {
            let tx = tx.clone();
            let member = Arc::clone(member);
            self.pool.execute(move || {
                let result = {
                    let mut member = lock_member(&member);
                    match operation {
                        GroupOperation::Start => member.start(timeout.unwrap_or(Duration::MAX)),
                        GroupOperation::Stop => member.stop(timeout),
                    }
                };
                let _ = tx.send((index, result));
            })?;
        }
        // Only the jobs hold senders now, so a disconnect means every job ended
        drop(tx);

        let mut pending: BTreeSet<usize> = (0..self.members.len()).collect();
        let mut failures = Vec::new();

        while !pending.is_empty() {
            let received = match deadline {
                Some(deadline) => {
                    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok((index, Ok(()))) => {
                    pending.remove(&index);
                }
                Ok((index, Err(error))) => {
                    pending.remove(&index);
                    failures.push(MemberFailure {
                        index,
                        name: self.names[index].clone(),
                        error,
                    });
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    // Jobs that ended without reporting panicked
                    for index in std::mem::take(&mut pending) {
                        failures.push(MemberFailure {
                            index,
                            name: self.names[index].clone(),
                            error: HarnessError::Panicked { operation },
                        });
                    }
                }
            }
        }

        failures.sort_by_key(|failure| failure.index);
        tracing::debug!(
            operation = operation.verb(),
            members = self.members.len(),
            pending = pending.len(),
            failed = failures.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "group operation finished"
        );

        if !pending.is_empty() {
            return Err(HarnessError::GroupTimeout {
                operation,
                pending: pending.into_iter().collect(),
                failures,
            });
        }
        if !failures.is_empty() {
            return Err(HarnessError::GroupMemberFailures {
                operation,
                failures,
            });
        }
        Ok(())
    }
}

impl Lifecycle for ServiceGroup {
    fn start(&mut self, timeout: Duration) -> Result<()> {
        ServiceGroup::start(self, timeout)
    }

    fn stop(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.fan_out(GroupOperation::Stop, timeout)
    }

    fn name(&self) -> String {
        format!("group[{}]", self.names.join(", "))
    }
}

fn lock_member(member: &Mutex<Box<dyn Lifecycle>>) -> MutexGuard<'_, Box<dyn Lifecycle>> {
    member.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
