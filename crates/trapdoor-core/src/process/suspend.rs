//! # Thread Suspension
//!
//! Two ref-counted ways of holding threads still:
//!
//! - [`ThreadSuspension`] isolates one thread while it executes the
//!   instruction under a lifted breakpoint, so no sibling runs through the
//!   unpatched address.
//! - [`ProcessSuspension`] holds a whole running process while the
//!   breakpoint table is edited.
//!
//! Suspending or resuming a thread that is already exiting fails with an
//! access-denied style error. That is logged and treated as success.

use tracing::{debug, warn};

use crate::error::Result;
use crate::target::ProcessTarget;
use crate::types::ThreadId;

fn suspend_tolerant(target: &mut dyn ProcessTarget, thread: ThreadId) -> Result<()>
{
    match target.suspend_thread(thread) {
        Err(error) if error.is_access_denied() => {
            warn!(thread = thread.raw(), %error, "Suspending an exiting thread, ignored");
            Ok(())
        }
        other => other,
    }
}

fn resume_tolerant(target: &mut dyn ProcessTarget, thread: ThreadId) -> Result<()>
{
    match target.resume_thread(thread) {
        Err(error) if error.is_access_denied() => {
            warn!(thread = thread.raw(), %error, "Resuming an exiting thread, ignored");
            Ok(())
        }
        other => other,
    }
}

/// Resume `threads`, carrying on past failures; the first failure is returned.
fn resume_all(target: &mut dyn ProcessTarget, threads: impl IntoIterator<Item = ThreadId>) -> Result<()>
{
    let mut first_error = None;
    for thread in threads {
        if let Err(error) = resume_tolerant(target, thread) {
            warn!(thread = thread.raw(), %error, "Failed to resume thread");
            first_error.get_or_insert(error);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Suspend `threads` in order; on failure the ones already suspended are resumed.
fn suspend_all(target: &mut dyn ProcessTarget, threads: impl IntoIterator<Item = ThreadId>) -> Result<Vec<ThreadId>>
{
    let mut done = Vec::new();
    for thread in threads {
        if let Err(error) = suspend_tolerant(target, thread) {
            // the suspend error is the one to report
            if let Err(undo) = resume_all(target, done.iter().rev().copied()) {
                warn!(error = %undo, "Threads left suspended after failed suspend");
            }
            return Err(error);
        }
        done.push(thread);
    }
    Ok(done)
}

/// Keeps every thread but one suspended
///
/// Nested requests only bump a depth counter. The first request suspends,
/// the matching last release resumes.
#[derive(Debug, Default)]
pub struct ThreadSuspension
{
    depth: u32,
    suspended: Vec<ThreadId>,
}

impl ThreadSuspension
{
    /// Create an inactive suspension.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Whether sibling threads are currently held.
    #[must_use]
    pub fn is_active(&self) -> bool
    {
        self.depth > 0
    }

    /// Nesting depth.
    #[must_use]
    pub fn depth(&self) -> u32
    {
        self.depth
    }

    /// Threads this suspension holds.
    #[must_use]
    pub fn suspended(&self) -> &[ThreadId]
    {
        &self.suspended
    }

    /// Suspend every thread in `threads` except `except`
    ///
    /// ## Errors
    ///
    /// The first suspend failure; threads suspended before it are resumed
    /// and the depth is unchanged.
    pub fn suspend_others(
        &mut self,
        target: &mut dyn ProcessTarget,
        threads: impl IntoIterator<Item = ThreadId>,
        except: ThreadId,
    ) -> Result<()>
    {
        if self.depth > 0 {
            self.depth += 1;
            return Ok(());
        }

        self.suspended = suspend_all(target, threads.into_iter().filter(|thread| *thread != except))?;
        self.depth = 1;
        debug!(running = except.raw(), held = self.suspended.len(), "Isolated thread");
        Ok(())
    }

    /// Undo one [`ThreadSuspension::suspend_others`]
    ///
    /// ## Errors
    ///
    /// The first resume failure. Every held thread is still attempted.
    pub fn resume_others(&mut self, target: &mut dyn ProcessTarget) -> Result<()>
    {
        match self.depth {
            0 => Ok(()),
            1 => {
                self.depth = 0;
                let threads = std::mem::take(&mut self.suspended);
                debug!(held = threads.len(), "Releasing isolated siblings");
                resume_all(target, threads)
            }
            _ => {
                self.depth -= 1;
                Ok(())
            }
        }
    }

    /// Hold a thread created while the suspension is active.
    pub fn apply_to_new_thread(&mut self, target: &mut dyn ProcessTarget, thread: ThreadId) -> Result<()>
    {
        if self.depth == 0 {
            return Ok(());
        }

        suspend_tolerant(target, thread)?;
        self.suspended.push(thread);
        Ok(())
    }

    /// Stop tracking a thread that exited.
    pub fn forget_thread(&mut self, thread: ThreadId)
    {
        self.suspended.retain(|held| *held != thread);
    }
}

/// Whole-process suspend count
///
/// Used to bracket breakpoint edits on a running process.
#[derive(Debug, Default)]
pub struct ProcessSuspension
{
    count: u32,
}

impl ProcessSuspension
{
    /// Current suspend count.
    #[must_use]
    pub fn count(&self) -> u32
    {
        self.count
    }

    /// Suspend every thread if this is the first request
    ///
    /// ## Errors
    ///
    /// The first suspend failure; threads already suspended are resumed and
    /// the count is unchanged.
    pub fn suspend(&mut self, target: &mut dyn ProcessTarget, threads: impl IntoIterator<Item = ThreadId>) -> Result<()>
    {
        if self.count == 0 {
            suspend_all(target, threads)?;
        }
        self.count += 1;
        Ok(())
    }

    /// Resume every thread when the last request is released.
    pub fn resume(&mut self, target: &mut dyn ProcessTarget, threads: impl IntoIterator<Item = ThreadId>) -> Result<()>
    {
        match self.count {
            0 => Ok(()),
            1 => {
                self.count = 0;
                resume_all(target, threads)
            }
            _ => {
                self.count -= 1;
                Ok(())
            }
        }
    }

    /// Bring a new thread in line with the current count.
    pub fn apply_to_new_thread(&self, target: &mut dyn ProcessTarget, thread: ThreadId) -> Result<()>
    {
        if self.count > 0 {
            suspend_tolerant(target, thread)?;
        }
        Ok(())
    }
}
