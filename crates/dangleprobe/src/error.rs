use thiserror::Error;

pub type Result<T> = std::result::Result<T, ObserverError>;

/// Reasons an observer cannot be created in the current build/runtime.
///
/// These are expected conditions: tests that need an observer should skip
/// themselves instead of failing when they see one.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverError {
    #[error("DanglingPtrObserver requires backup-reference-pointer feature enabled")]
    BackupRefPtrDisabled,

    #[error("DanglingPtrObserver requires allocator-as-malloc build flag")]
    AllocatorNotMalloc,

    #[error("DanglingPtrObserver requires dangling-checks build flag")]
    DanglingChecksDisabled,

    #[error("DanglingPtrObserver requires performance-experiment flag off")]
    PerfExperimentEnabled,
}

impl ObserverError {
    /// Short reason without the type prefix.
    pub fn reason(&self) -> &'static str {
        match self {
            ObserverError::BackupRefPtrDisabled => {
                "requires backup-reference-pointer feature enabled"
            }
            ObserverError::AllocatorNotMalloc => "requires allocator-as-malloc build flag",
            ObserverError::DanglingChecksDisabled => "requires dangling-checks build flag",
            ObserverError::PerfExperimentEnabled => "requires performance-experiment flag off",
        }
    }
}
