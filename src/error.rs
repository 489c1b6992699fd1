use thiserror::Error;

/// Errors surfaced by the try/wait synchronization calls.
///
/// Everything else in the library's failure model is unrecoverable
/// (bad flag combinations, calls before init, transport failures,
/// consensus mismatch) and aborts the process with a descriptive
/// panic: once a collective has published side effects to peers,
/// correctness cannot be restored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The operation cannot complete without further progress; poll
    /// again.
    #[error("collective operation has not yet completed")]
    NotReady,
    /// The handle was already consumed by a successful sync, or was
    /// never valid.
    #[error("invalid or already-consumed collective handle")]
    InvalidHandle,
}
