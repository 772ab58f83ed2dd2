use crate::errors::{LockError, LockResult};

/// Address of one Redis-compatible server backing the quorum.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
}

impl<T: Into<String>> From<T> for ServerConfig {
    fn from(addr: T) -> Self {
        ServerConfig { addr: addr.into() }
    }
}

/// Per-call-overridable tuning knobs. Construct with [`Settings::default`] and adjust
/// the fields you care about, the way the teacher's `Config` was built.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Fraction of the lease duration subtracted from the effective expiration to
    /// tolerate clock skew between this process and the servers.
    pub drift_factor: f64,
    /// Maximum additional attempts after the first. `-1` means unbounded.
    pub retry_count: i64,
    /// Base inter-attempt delay, in milliseconds.
    pub retry_delay_ms: i64,
    /// Symmetric additive jitter bound applied to `retry_delay_ms`, in milliseconds.
    pub retry_jitter_ms: i64,
    /// Milliseconds before expiration at which the scoped holder schedules an extension.
    pub automatic_extension_threshold_ms: i64,
    /// Server-side database index, 0-15. Out-of-range values are silently coerced to 0.
    pub db: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            drift_factor: 0.01,
            retry_count: 10,
            retry_delay_ms: 200,
            retry_jitter_ms: 100,
            automatic_extension_threshold_ms: 500,
            db: 0,
        }
    }
}

impl Settings {
    /// Coerces `db` into `0..=15`, preserving the upstream library's silent-coerce
    /// behavior for out-of-range values rather than erroring (see DESIGN.md).
    pub(crate) fn normalized_db(&self) -> i64 {
        if (0..=15).contains(&self.db) {
            self.db
        } else {
            0
        }
    }

    /// Unbounded retry is requested with the `-1` sentinel.
    pub(crate) fn max_attempts(&self) -> Option<u64> {
        if self.retry_count < 0 {
            None
        } else {
            Some(self.retry_count as u64 + 1)
        }
    }

    pub(crate) fn validate_duration(duration_ms: i64) -> LockResult<()> {
        if duration_ms < 1 {
            return Err(LockError::invalid_argument(format!(
                "duration must be an integer >= 1 ms, got {duration_ms}"
            )));
        }
        Ok(())
    }

    pub(crate) fn validate_extension_threshold(&self, duration_ms: i64) -> LockResult<()> {
        if self.automatic_extension_threshold_ms > duration_ms - 100 {
            return Err(LockError::invalid_argument(format!(
                "automatic_extension_threshold_ms ({}) must be <= duration_ms - 100 ({})",
                self.automatic_extension_threshold_ms,
                duration_ms - 100
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_upstream() {
        let settings = Settings::default();
        assert_eq!(settings.retry_count, 10);
        assert_eq!(settings.retry_delay_ms, 200);
        assert_eq!(settings.retry_jitter_ms, 100);
        assert_eq!(settings.drift_factor, 0.01);
        assert_eq!(settings.automatic_extension_threshold_ms, 500);
        assert_eq!(settings.db, 0);
    }

    #[test]
    fn db_out_of_range_coerces_to_zero() {
        let mut settings = Settings::default();
        settings.db = 42;
        assert_eq!(settings.normalized_db(), 0);
        settings.db = -1;
        assert_eq!(settings.normalized_db(), 0);
        settings.db = 15;
        assert_eq!(settings.normalized_db(), 15);
    }

    #[test]
    fn unbounded_retry_count_has_no_max_attempts() {
        let mut settings = Settings::default();
        settings.retry_count = -1;
        assert_eq!(settings.max_attempts(), None);
    }

    #[test]
    fn bounded_retry_count_is_count_plus_one() {
        let mut settings = Settings::default();
        settings.retry_count = 10;
        assert_eq!(settings.max_attempts(), Some(11));
    }

    #[test]
    fn duration_must_be_positive() {
        assert!(Settings::validate_duration(0).is_err());
        assert!(Settings::validate_duration(-5).is_err());
        assert!(Settings::validate_duration(1).is_ok());
    }

    #[test]
    fn extension_threshold_must_leave_room() {
        let mut settings = Settings::default();
        settings.automatic_extension_threshold_ms = 901;
        assert!(settings.validate_extension_threshold(1000).is_err());
        settings.automatic_extension_threshold_ms = 900;
        assert!(settings.validate_extension_threshold(1000).is_ok());
    }
}
