//! Outcome of handling one exception.

use std::fmt;

/// What the machine decided about an exception
///
/// Variants are ordered by precedence. When several parties react to the
/// same trap, the strongest reaction wins (see [`MachineResult::combine`]):
/// stopping beats continuing, continuing beats not handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum MachineResult
{
    /// Not ours. The client decides what happens to the exception.
    #[default]
    NotHandled,
    /// Consumed; let the process run on.
    HandledContinue,
    /// Consumed; keep the process stopped without notifying anyone.
    HandledStopped,
    /// A user breakpoint was hit.
    PendingCallbackBp,
    /// The active step finished.
    PendingCallbackStep,
    /// The debuggee executed its own `INT3`.
    PendingCallbackEmbeddedBp,
    /// A trace trap arrived that no step was waiting for.
    PendingCallbackEmbeddedStep,
}

impl MachineResult
{
    /// The stronger of two reactions to the same trap.
    ///
    /// ```rust
    /// use trapdoor_core::machine::MachineResult;
    ///
    /// let result = MachineResult::HandledContinue.combine(MachineResult::HandledStopped);
    /// assert_eq!(result, MachineResult::HandledStopped);
    /// ```
    #[must_use]
    pub fn combine(self, other: Self) -> Self
    {
        self.max(other)
    }

    /// Whether the client gets a notification for this result.
    #[must_use]
    pub fn is_pending_callback(self) -> bool
    {
        self >= Self::PendingCallbackBp
    }
}

impl fmt::Display for MachineResult
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Self::NotHandled => "not handled",
            Self::HandledContinue => "handled, continue",
            Self::HandledStopped => "handled, stopped",
            Self::PendingCallbackBp => "breakpoint",
            Self::PendingCallbackStep => "step complete",
            Self::PendingCallbackEmbeddedBp => "embedded breakpoint",
            Self::PendingCallbackEmbeddedStep => "embedded step",
        };
        f.write_str(name)
    }
}
