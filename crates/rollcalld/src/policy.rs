//! Dedup & throttle policy: one shared slot for the last action taken.

use chrono::{Duration, NaiveDateTime};
use rollcall_core::IdentityId;

/// Who the last action was taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Known(IdentityId),
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Today's ledger already holds this identity.
    AlreadyRecorded,
    /// Too soon after the last action.
    Debounced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Act,
    Skip(SkipReason),
}

/// Process-lifetime throttle state. Idle until the first action.
///
/// The slot is shared between known and unknown subjects: an unknown face
/// is suppressed within the window after any action, while a known face is
/// only debounced against its own previous action.
#[derive(Debug, Clone)]
pub struct ThrottlePolicy {
    window: Duration,
    last: Option<(Subject, NaiveDateTime)>,
}

impl ThrottlePolicy {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Decide for a recognized identity. `already_recorded` is the ledger check
    /// for today and takes precedence over the debounce.
    pub fn on_known(&self, id: IdentityId, already_recorded: bool, now: NaiveDateTime) -> Decision {
        if already_recorded {
            return Decision::Skip(SkipReason::AlreadyRecorded);
        }
        match self.last {
            Some((Subject::Known(last_id), at)) if last_id == id && self.within_window(at, now) => {
                Decision::Skip(SkipReason::Debounced)
            }
            _ => Decision::Act,
        }
    }

    /// Decide for an unrecognized face; any recent action suppresses it.
    pub fn on_unknown(&self, now: NaiveDateTime) -> Decision {
        match self.last {
            Some((_, at)) if self.within_window(at, now) => Decision::Skip(SkipReason::Debounced),
            _ => Decision::Act,
        }
    }

    /// Record that an action was taken for `subject` at `now`.
    pub fn mark(&mut self, subject: Subject, now: NaiveDateTime) {
        self.last = Some((subject, now));
    }

    fn within_window(&self, at: NaiveDateTime, now: NaiveDateTime) -> bool {
        now.signed_duration_since(at) <= self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    fn policy() -> ThrottlePolicy {
        ThrottlePolicy::new(Duration::seconds(10))
    }

    #[test]
    fn test_idle_acts() {
        let p = policy();
        assert_eq!(p.on_known(0, false, at(9, 0, 0)), Decision::Act);
        assert_eq!(p.on_unknown(at(9, 0, 0)), Decision::Act);
    }

    #[test]
    fn test_ledger_check_precedes_debounce() {
        let p = policy();
        assert_eq!(p.on_known(0, true, at(9, 0, 0)), Decision::Skip(SkipReason::AlreadyRecorded));
    }

    #[test]
    fn test_known_debounced_against_itself_only() {
        let mut p = policy();
        p.mark(Subject::Known(0), at(9, 10, 0));
        assert_eq!(p.on_known(0, false, at(9, 10, 5)), Decision::Skip(SkipReason::Debounced));
        assert_eq!(p.on_known(0, false, at(9, 10, 10)), Decision::Skip(SkipReason::Debounced));
        assert_eq!(p.on_known(0, false, at(9, 10, 11)), Decision::Act);
        assert_eq!(p.on_known(1, false, at(9, 10, 1)), Decision::Act);
    }

    #[test]
    fn test_unknown_debounced_after_any_action() {
        let mut p = policy();
        p.mark(Subject::Known(3), at(9, 0, 0));
        assert_eq!(p.on_unknown(at(9, 0, 3)), Decision::Skip(SkipReason::Debounced));

        p.mark(Subject::Unknown, at(9, 1, 0));
        assert_eq!(p.on_unknown(at(9, 1, 3)), Decision::Skip(SkipReason::Debounced));
        assert_eq!(p.on_unknown(at(9, 1, 11)), Decision::Act);
    }

    #[test]
    fn test_unknown_action_does_not_block_known() {
        let mut p = policy();
        p.mark(Subject::Unknown, at(9, 0, 0));
        assert_eq!(p.on_known(0, false, at(9, 0, 1)), Decision::Act);
    }

    #[test]
    fn test_mark_replaces_slot() {
        let mut p = policy();
        p.mark(Subject::Known(0), at(9, 0, 0));
        p.mark(Subject::Known(1), at(9, 0, 2));
        assert_eq!(p.on_known(1, false, at(9, 0, 3)), Decision::Skip(SkipReason::Debounced));
        assert_eq!(p.on_known(0, false, at(9, 0, 3)), Decision::Act);
    }
}
