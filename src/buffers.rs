//! Growth policies for the two query buffers whose required size the OS only
//! reveals by rejecting the previous attempt.

use crate::error::{SearchError, STATUS_INFO_LENGTH_MISMATCH};

/// First size tried for the system handle snapshot.
pub const SNAPSHOT_INITIAL_SIZE: usize = 0x10000;

/// Snapshot sizes past this are a sign something is deeply wrong.
pub const SNAPSHOT_CEILING: usize = 64 * 1024 * 1024;

/// A final snapshot size is only worth remembering as the next seed when it
/// stays below this.
pub const SNAPSHOT_SEED_KEEP: usize = 0x200000;

/// First size tried for the object-name buffer.
pub const NAME_BUFFER_INITIAL_SIZE: usize = 0x200;

/// The I/O subsystem likes to report wrong required lengths, so the name
/// query is retried, but only this many times.
pub const NAME_QUERY_ATTEMPTS: u32 = 8;

/// Adaptive initial size for the snapshot buffer, carried by the caller
/// between searches so repeated growth is amortized.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotSeed(usize);

impl Default for SnapshotSeed {
    fn default() -> Self {
        Self(SNAPSHOT_INITIAL_SIZE)
    }
}

impl SnapshotSeed {
    pub fn initial(&self) -> usize {
        self.0
    }

    pub fn remember(&mut self, final_size: usize) {
        if final_size <= SNAPSHOT_SEED_KEEP {
            self.0 = final_size;
        }
    }
}

/// One attempt at filling the snapshot buffer.
pub enum SnapshotProbe {
    Done,
    /// The buffer was too small; throw it away and double.
    Grow,
    Fail(i32),
}

/// One attempt at querying an object name.
pub enum NameProbe {
    /// Success; carries the name length in characters.
    Done(usize),
    /// The OS wants a buffer of this many bytes instead.
    Grow(usize),
    Fail(i32),
}

/// Drive `attempt` (reallocate to the given size, then query) until it
/// succeeds, doubling the size on every `Grow`. Exceeding `ceiling` fails
/// with `ResourceExhausted` rather than looping forever.
///
/// Returns the size that finally fit.
pub fn snapshot_probe_loop(
    seed: usize,
    ceiling: usize,
    mut attempt: impl FnMut(usize) -> Result<SnapshotProbe, SearchError>,
) -> Result<usize, SearchError> {
    let mut size = seed;
    loop {
        match attempt(size)? {
            SnapshotProbe::Done => return Ok(size),
            SnapshotProbe::Fail(status) => return Err(SearchError::SnapshotFailed { status }),
            SnapshotProbe::Grow => {
                size *= 2;
                if size > ceiling {
                    return Err(SearchError::ResourceExhausted {
                        what: "handle snapshot buffer",
                    });
                }
            }
        }
    }
}

/// Drive `attempt` (reallocate to the given size, then query) until it
/// succeeds, taking the required size from every `Grow`, for at most
/// `max_attempts` tries.
///
/// Returns the name length in characters.
pub fn name_query_loop(
    max_attempts: u32,
    initial_size: usize,
    mut attempt: impl FnMut(usize) -> Result<NameProbe, SearchError>,
) -> Result<usize, SearchError> {
    let mut size = initial_size;
    for _ in 0..max_attempts {
        match attempt(size)? {
            NameProbe::Done(chars) => return Ok(chars),
            NameProbe::Fail(status) => return Err(SearchError::ObjectUnresolvable { status }),
            NameProbe::Grow(needed) => {
                log::debug!("name query realloc from {size} to {needed}");
                size = needed;
            }
        }
    }
    Err(SearchError::ObjectUnresolvable {
        status: STATUS_INFO_LENGTH_MISMATCH,
    })
}
