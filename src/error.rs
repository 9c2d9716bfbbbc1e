use std::borrow::Cow;

use thiserror::Error;

// NTSTATUS values the search runs into often enough to deserve a readable
// message. Kept as plain i32 so the table works off-Windows in tests.
pub const STATUS_UNSUCCESSFUL: i32 = 0xC000_0001_u32 as i32;
pub const STATUS_NOT_IMPLEMENTED: i32 = 0xC000_0002_u32 as i32;
pub const STATUS_INFO_LENGTH_MISMATCH: i32 = 0xC000_0004_u32 as i32;
pub const STATUS_INVALID_HANDLE: i32 = 0xC000_0008_u32 as i32;
pub const STATUS_INVALID_PARAMETER: i32 = 0xC000_000D_u32 as i32;
pub const STATUS_NO_MEMORY: i32 = 0xC000_0017_u32 as i32;
pub const STATUS_ACCESS_DENIED: i32 = 0xC000_0022_u32 as i32;
pub const STATUS_BUFFER_TOO_SMALL: i32 = 0xC000_0023_u32 as i32;
pub const STATUS_OBJECT_TYPE_MISMATCH: i32 = 0xC000_0024_u32 as i32;
pub const STATUS_OBJECT_NAME_INVALID: i32 = 0xC000_0033_u32 as i32;
pub const STATUS_OBJECT_NAME_NOT_FOUND: i32 = 0xC000_0034_u32 as i32;
pub const STATUS_OBJECT_PATH_INVALID: i32 = 0xC000_0039_u32 as i32;
pub const STATUS_SHARING_VIOLATION: i32 = 0xC000_0043_u32 as i32;
pub const STATUS_INSUFFICIENT_RESOURCES: i32 = 0xC000_009A_u32 as i32;
pub const STATUS_NOT_SUPPORTED: i32 = 0xC000_00BB_u32 as i32;
pub const STATUS_BUFFER_OVERFLOW: i32 = 0x8000_0005_u32 as i32;

/// Render an NTSTATUS as an error message.
pub fn status_message(status: i32) -> Cow<'static, str> {
    match status {
        STATUS_UNSUCCESSFUL => "Operation Failed".into(),
        STATUS_BUFFER_OVERFLOW => "Buffer Overflow".into(),
        STATUS_NOT_IMPLEMENTED => "Not Implemented".into(),
        STATUS_INFO_LENGTH_MISMATCH => "Info Length Mismatch".into(),
        STATUS_INVALID_HANDLE => "Invalid Handle".into(),
        STATUS_INVALID_PARAMETER => "Invalid Parameter".into(),
        STATUS_NO_MEMORY => "Not Enough Quota".into(),
        STATUS_ACCESS_DENIED => "Access Denied".into(),
        STATUS_BUFFER_TOO_SMALL => "Buffer Too Small".into(),
        STATUS_OBJECT_TYPE_MISMATCH => "Wrong Type".into(),
        STATUS_OBJECT_NAME_INVALID => "Object Name Invalid".into(),
        STATUS_OBJECT_NAME_NOT_FOUND => "Object Name not found".into(),
        STATUS_OBJECT_PATH_INVALID => "Object Path Invalid".into(),
        STATUS_SHARING_VIOLATION => "Sharing Violation".into(),
        STATUS_INSUFFICIENT_RESOURCES => "Insufficient resources".into(),
        STATUS_NOT_SUPPORTED => "Operation is not supported".into(),
        _ => format!("Unknown error 0x{:08x}", status as u32).into(),
    }
}

/// Everything that can go wrong during a handle search.
///
/// Only [`SearchError::CapabilityUnavailable`], a failed snapshot capture and
/// [`SearchError::OutOfMemory`] at setup time abort a search; every
/// per-candidate failure is absorbed as a skip so that one uncooperative
/// handle never derails the scan of thousands of others.
#[derive(Debug, Error)]
pub enum SearchError {
    /// A required ntdll entry point could not be resolved.
    #[error("native entry point {0} is unavailable")]
    CapabilityUnavailable(&'static str),

    /// A growable buffer hit its hard size ceiling.
    #[error("{what} exceeded its size ceiling")]
    ResourceExhausted { what: &'static str },

    /// The arena refused an allocation. Never retried.
    #[error("arena allocation of {0} bytes failed")]
    OutOfMemory(usize),

    /// The system handle snapshot could not be captured.
    #[error("handle snapshot failed: {}", status_message(*.status))]
    SnapshotFailed { status: i32 },

    /// Opening another process was refused. Expected and frequent; memoized
    /// so the same process is not retried within one search.
    #[error("access denied opening process {pid}")]
    AccessDenied { pid: u32 },

    /// Duplication or name query failed for one specific handle.
    #[error("object not resolvable: {}", status_message(*.status))]
    ObjectUnresolvable { status: i32 },
}
