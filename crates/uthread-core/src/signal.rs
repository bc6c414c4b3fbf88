//! Signal numbers, signal sets and dispositions.
//!
//! Numbering follows Linux. Signal sets are 64-bit masks where bit `n - 1`
//! stands for signal `n`.

use std::fmt;

use serde::Serialize;

use crate::errno::{Errno, Result};

pub type Signal = i32;

pub const SIGHUP: Signal = 1;
pub const SIGINT: Signal = 2;
pub const SIGQUIT: Signal = 3;
pub const SIGILL: Signal = 4;
pub const SIGTRAP: Signal = 5;
pub const SIGABRT: Signal = 6;
pub const SIGBUS: Signal = 7;
pub const SIGFPE: Signal = 8;
pub const SIGKILL: Signal = 9;
pub const SIGUSR1: Signal = 10;
pub const SIGSEGV: Signal = 11;
pub const SIGUSR2: Signal = 12;
pub const SIGPIPE: Signal = 13;
pub const SIGALRM: Signal = 14;
pub const SIGTERM: Signal = 15;
pub const SIGCHLD: Signal = 17;
pub const SIGCONT: Signal = 18;
pub const SIGSTOP: Signal = 19;
pub const SIGTSTP: Signal = 20;
pub const SIGURG: Signal = 23;
pub const SIGVTALRM: Signal = 26;
pub const SIGPROF: Signal = 27;
pub const SIGWINCH: Signal = 28;
pub const SIGIO: Signal = 29;

/// Highest valid signal number.
pub const SIG_MAX: Signal = 64;

#[must_use]
pub fn is_valid(sig: Signal) -> bool {
    (1..=SIG_MAX).contains(&sig)
}

pub fn validate(sig: Signal) -> Result<Signal> {
    if is_valid(sig) { Ok(sig) } else { Err(Errno::EINVAL) }
}

/// Signals that can be neither caught, ignored nor blocked.
#[must_use]
pub fn is_unblockable(sig: Signal) -> bool {
    sig == SIGKILL || sig == SIGSTOP
}

/// Signals whose default action is to do nothing.
#[must_use]
pub fn default_ignored(sig: Signal) -> bool {
    matches!(sig, SIGCHLD | SIGCONT | SIGURG | SIGWINCH) || sig > 31
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SigSet(u64);

impl SigSet {
    pub const EMPTY: SigSet = SigSet(0);
    pub const FULL: SigSet = SigSet(u64::MAX);

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        SigSet(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn of(signals: &[Signal]) -> Self {
        signals.iter().fold(SigSet::EMPTY, |set, &sig| set.with(sig))
    }

    #[must_use]
    pub fn with(self, sig: Signal) -> Self {
        if is_valid(sig) {
            SigSet(self.0 | (1 << (sig - 1)))
        } else {
            self
        }
    }

    #[must_use]
    pub fn without(self, sig: Signal) -> Self {
        if is_valid(sig) {
            SigSet(self.0 & !(1 << (sig - 1)))
        } else {
            self
        }
    }

    pub fn insert(&mut self, sig: Signal) {
        *self = self.with(sig);
    }

    pub fn remove(&mut self, sig: Signal) {
        *self = self.without(sig);
    }

    #[must_use]
    pub fn contains(self, sig: Signal) -> bool {
        is_valid(sig) && self.0 & (1 << (sig - 1)) != 0
    }

    #[must_use]
    pub const fn union(self, other: SigSet) -> SigSet {
        SigSet(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersect(self, other: SigSet) -> SigSet {
        SigSet(self.0 & other.0)
    }

    #[must_use]
    pub const fn difference(self, other: SigSet) -> SigSet {
        SigSet(self.0 & !other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Removes the signals no mask may hold.
    #[must_use]
    pub fn maskable(self) -> SigSet {
        self.without(SIGKILL).without(SIGSTOP)
    }

    /// Lowest-numbered member.
    #[must_use]
    pub fn first(self) -> Option<Signal> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as Signal + 1)
        }
    }

    pub fn iter(self) -> impl Iterator<Item = Signal> {
        (1..=SIG_MAX).filter(move |&sig| self.contains(sig))
    }
}

impl fmt::Debug for SigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// How `sigmask` combines the supplied set with the current mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigHow {
    Block,
    Unblock,
    SetMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Default,
    Ignore,
    Catch,
}

/// Scheduler-side view of a `sigaction`; the handler itself is kept by the
/// runtime, keyed by signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigAction {
    pub disposition: Disposition,
    /// Extra signals blocked while the handler runs.
    pub mask: SigSet,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            disposition: Disposition::Default,
            mask: SigSet::EMPTY,
        }
    }
}

impl SigAction {
    #[must_use]
    pub fn catch(mask: SigSet) -> Self {
        Self {
            disposition: Disposition::Catch,
            mask,
        }
    }

    #[must_use]
    pub fn ignore() -> Self {
        Self {
            disposition: Disposition::Ignore,
            mask: SigSet::EMPTY,
        }
    }
}

/// What a signal does when it reaches an unmasked thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Discard,
    Handle,
    Terminate,
}

#[must_use]
pub fn effect_of(sig: Signal, action: &SigAction) -> Effect {
    match action.disposition {
        Disposition::Ignore => Effect::Discard,
        Disposition::Catch => Effect::Handle,
        Disposition::Default if default_ignored(sig) => Effect::Discard,
        Disposition::Default => Effect::Terminate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_membership_and_first() {
        let set = SigSet::of(&[SIGUSR2, SIGUSR1, SIGHUP]);
        assert!(set.contains(SIGUSR1));
        assert!(!set.contains(SIGTERM));
        assert_eq!(set.first(), Some(SIGHUP));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![SIGHUP, SIGUSR1, SIGUSR2]);
        assert_eq!(set.without(SIGHUP).first(), Some(SIGUSR1));
    }

    #[test]
    fn invalid_signals_are_ignored_by_sets() {
        let set = SigSet::EMPTY.with(0).with(SIG_MAX + 1);
        assert!(set.is_empty());
        assert_eq!(validate(0), Err(Errno::EINVAL));
        assert_eq!(validate(SIG_MAX), Ok(SIG_MAX));
    }

    #[test]
    fn kill_and_stop_are_never_maskable() {
        let set = SigSet::FULL.maskable();
        assert!(!set.contains(SIGKILL));
        assert!(!set.contains(SIGSTOP));
        assert!(set.contains(SIGINT));
    }

    #[test]
    fn default_effects() {
        let dfl = SigAction::default();
        assert_eq!(effect_of(SIGCHLD, &dfl), Effect::Discard);
        assert_eq!(effect_of(SIGTERM, &dfl), Effect::Terminate);
        assert_eq!(effect_of(SIGTERM, &SigAction::ignore()), Effect::Discard);
        assert_eq!(effect_of(SIGCHLD, &SigAction::catch(SigSet::EMPTY)), Effect::Handle);
    }
}
