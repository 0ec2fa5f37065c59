use crate::error::{ObserverError, Result};

/// Runtime switch for the backup-reference-pointer feature.
pub const BACKUP_REF_PTR_ENV: &str = "DANGLEPROBE_BACKUP_REF_PTR";

/// Build and runtime prerequisites an observer depends on.
///
/// Every field is a plain boolean so the feasibility policy can be exercised
/// with any combination, independent of how this crate was compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildConfig {
    /// Backup-reference-pointer protection is enabled at runtime.
    pub backup_ref_ptr_enabled: bool,
    /// The allocator is the process's primary allocator.
    pub allocator_as_malloc: bool,
    /// Dangling checked-pointer checks are compiled in.
    pub dangling_checks: bool,
    /// Checks are sampled rather than exact.
    pub perf_experiment: bool,
}

impl BuildConfig {
    /// A configuration in which every prerequisite holds.
    pub const fn supported() -> Self {
        BuildConfig {
            backup_ref_ptr_enabled: true,
            allocator_as_malloc: true,
            dangling_checks: true,
            perf_experiment: false,
        }
    }

    /// Read the configuration of the running process.
    ///
    /// Build flags come from cargo features; the backup-reference-pointer
    /// flag is read from [`BACKUP_REF_PTR_ENV`] on every call.
    pub fn current() -> Self {
        BuildConfig {
            backup_ref_ptr_enabled: backup_ref_ptr_from_env(),
            allocator_as_malloc: cfg!(feature = "allocator-as-malloc"),
            dangling_checks: cfg!(feature = "dangling-checks"),
            perf_experiment: cfg!(feature = "perf-experiment"),
        }
    }

    /// Evaluate the prerequisites in order. The first unmet one is reported.
    pub fn check(&self) -> Result<()> {
        if !self.backup_ref_ptr_enabled {
            return Err(ObserverError::BackupRefPtrDisabled);
        }
        if !self.allocator_as_malloc {
            return Err(ObserverError::AllocatorNotMalloc);
        }
        if !self.dangling_checks {
            return Err(ObserverError::DanglingChecksDisabled);
        }
        if self.perf_experiment {
            return Err(ObserverError::PerfExperimentEnabled);
        }
        Ok(())
    }
}

fn backup_ref_ptr_from_env() -> bool {
    match std::env::var(BACKUP_REF_PTR_ENV) {
        Ok(val) => parse_flag(&val).unwrap_or(true),
        Err(_) => true,
    }
}

/// Parse an on/off flag. Returns `None` for values that are neither.
fn parse_flag(val: &str) -> Option<bool> {
    let val = val.trim();
    const OFF: [&str; 4] = ["0", "false", "off", "no"];
    const ON: [&str; 4] = ["1", "true", "on", "yes"];
    if OFF.iter().any(|s| val.eq_ignore_ascii_case(s)) {
        Some(false)
    } else if ON.iter().any(|s| val.eq_ignore_ascii_case(s)) {
        Some(true)
    } else {
        None
    }
}
