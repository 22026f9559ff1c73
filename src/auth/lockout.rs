/// Brute-force Lockout Policy
///
/// Every login attempt on an unlocked account is counted before its password
/// is checked. Reaching the threshold sets `locked_until = now + cooldown`; a
/// successful check clears the count again. Expiry is evaluated lazily
/// whenever the state is read; nothing sweeps expired locks in the background.

use chrono::{DateTime, Duration, Utc};

use crate::configuration::LockoutSettings;

/// Lockout fields persisted on the user row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockoutState {
    pub failed_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl LockoutState {
    /// True while a lock window is still running
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if until > now)
    }
}

/// Outcome of reserving a login attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginAttempt {
    /// A lock window is running; nothing was counted
    Locked,
    /// The attempt is counted; carries the state the store now holds
    Reserved(LockoutState),
}

/// One login attempt, counted before the password is checked.
///
/// The store applies this atomically with the lock check, so concurrent
/// guesses can never get more than `max_failed_attempts` password checks per
/// lock window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptReservation {
    pub max_failed_attempts: i32,
    pub lock_until: DateTime<Utc>,
}

impl AttemptReservation {
    /// Compute the outcome against `current`.
    ///
    /// Stores that cannot run this in-process must express the same rules in
    /// a single statement (see `PgStore::reserve_login_attempt`).
    pub fn apply(&self, current: &LockoutState, now: DateTime<Utc>) -> LoginAttempt {
        if current.is_locked(now) {
            return LoginAttempt::Locked;
        }

        // Past the gate, any remaining `locked_until` has expired and starts a fresh count
        let failed_attempts = if current.locked_until.is_some() {
            1
        } else {
            current.failed_attempts.saturating_add(1)
        };

        let locked_until = if self.max_failed_attempts > 0 && failed_attempts >= self.max_failed_attempts {
            Some(self.lock_until)
        } else {
            None
        };

        LoginAttempt::Reserved(LockoutState {
            failed_attempts,
            locked_until,
        })
    }
}

/// Threshold and cooldown for account lockout
#[derive(Debug, Clone)]
pub struct LockoutPolicy {
    max_failed_attempts: i32,
    cooldown: Duration,
}

impl LockoutPolicy {
    pub fn new(max_failed_attempts: i32, cooldown: Duration) -> Self {
        Self {
            max_failed_attempts,
            cooldown,
        }
    }

    pub fn from_settings(settings: &LockoutSettings) -> Self {
        Self::new(
            settings.max_failed_attempts,
            Duration::seconds(settings.cooldown_seconds),
        )
    }

    pub fn reserve(&self, now: DateTime<Utc>) -> AttemptReservation {
        AttemptReservation {
            max_failed_attempts: self.max_failed_attempts,
            lock_until: now + self.cooldown,
        }
    }
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self::from_settings(&LockoutSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(policy: &LockoutPolicy, state: LockoutState, now: DateTime<Utc>) -> LockoutState {
        match policy.reserve(now).apply(&state, now) {
            LoginAttempt::Reserved(next) => next,
            LoginAttempt::Locked => panic!("unexpected lock"),
        }
    }

    #[test]
    fn test_locks_on_threshold() {
        let policy = LockoutPolicy::new(5, Duration::minutes(15));
        let now = Utc::now();
        let mut state = LockoutState::default();

        for count in 1..5 {
            state = attempt(&policy, state, now);
            assert_eq!(state.failed_attempts, count);
            assert!(!state.is_locked(now));
        }

        state = attempt(&policy, state, now);
        assert_eq!(state.failed_attempts, 5);
        assert_eq!(state.locked_until, Some(now + Duration::minutes(15)));
        assert!(state.is_locked(now));
    }

    #[test]
    fn test_locked_state_is_not_counted() {
        let policy = LockoutPolicy::new(5, Duration::minutes(15));
        let now = Utc::now();
        let state = LockoutState {
            failed_attempts: 5,
            locked_until: Some(now + Duration::minutes(1)),
        };

        assert_eq!(policy.reserve(now).apply(&state, now), LoginAttempt::Locked);
    }

    #[test]
    fn test_lock_expires_lazily() {
        let now = Utc::now();
        let state = LockoutState {
            failed_attempts: 5,
            locked_until: Some(now - Duration::seconds(1)),
        };

        assert!(!state.is_locked(now));
    }

    #[test]
    fn test_attempt_after_expired_lock_restarts_count() {
        let policy = LockoutPolicy::new(5, Duration::minutes(15));
        let now = Utc::now();
        let state = LockoutState {
            failed_attempts: 5,
            locked_until: Some(now - Duration::minutes(1)),
        };

        let next = attempt(&policy, state, now);
        assert_eq!(next.failed_attempts, 1);
        assert_eq!(next.locked_until, None);
    }

    #[test]
    fn test_zero_threshold_never_locks() {
        let policy = LockoutPolicy::new(0, Duration::minutes(15));
        let now = Utc::now();
        let mut state = LockoutState::default();
        for _ in 0..10 {
            state = attempt(&policy, state, now);
        }
        assert_eq!(state.failed_attempts, 10);
        assert!(state.locked_until.is_none());
    }
}
