//! Find which running processes hold an open handle to a given file or
//! volume, and report their executable paths, so a user knows what to close
//! before a storage device can be reformatted.
//!
//! The search snapshots every open handle in the system, duplicates each
//! foreign handle into this process, resolves its kernel object name and
//! matches it against the target under exact or prefix semantics. The
//! undocumented ntdll entry points this needs are resolved at startup into a
//! capability set; all working buffers come from a private arena scoped to
//! the search.
//!
//! The orchestrating engine is platform-neutral and generic over the
//! [`engine::System`] introspection trait; [`nt::NtSystem`] is the real
//! Windows implementation. User-facing result lines go through the
//! [`SearchHost`] sink, which also supplies cancellation polling and string
//! conversion.
//!
//! ```no_run
//! # #[cfg(windows)] {
//! use handleseek::{search_process, LogHost};
//!
//! let mut host = LogHost;
//! let busy = search_process(&mut host, r"\Device\HarddiskVolume3\file.txt", false, true);
//! # let _ = busy;
//! # }
//! ```

/// Format a line into the host's normal-tier sink.
#[macro_export]
macro_rules! reportln {
    ($host:expr, $($arg:tt)*) => {{
        $host.report(&format!($($arg)*))
    }};
}

pub mod buffers;
pub mod engine;
pub mod error;
pub mod host;
#[cfg(windows)]
pub mod nt;

pub use buffers::SnapshotSeed;
pub use engine::{search, HandleRecord, HandleSnapshot, SearchOptions, System};
pub use error::SearchError;
pub use host::{LogHost, OsGeneration, SearchHost};
#[cfg(windows)]
pub use nt::NtSystem;

/// Search all processes and report, through `host`, the ones that have a
/// handle open to `target`. Returns whether any were found.
#[cfg(windows)]
pub fn search_process(
    host: &mut impl SearchHost,
    target: &str,
    partial_match: bool,
    ignore_self: bool,
) -> bool {
    let mut seed = SnapshotSeed::default();
    let opts = SearchOptions {
        partial_match,
        ignore_self,
        ..Default::default()
    };
    search_process_with(host, target, &opts, &mut seed)
}

/// Like [`search_process`], with full options and caller-held adaptive
/// snapshot state, so repeated searches skip the buffer growth of the first.
#[cfg(windows)]
pub fn search_process_with(
    host: &mut impl SearchHost,
    target: &str,
    opts: &SearchOptions,
    seed: &mut SnapshotSeed,
) -> bool {
    let mut sys = match NtSystem::new(*seed) {
        Ok(sys) => sys,
        Err(e) => {
            reportln!(host, "Warning: could not enumerate process handles: {e}");
            reportln!(
                host,
                "NOTE: was not able to identify the process(es) preventing access to {target}"
            );
            return false;
        }
    };

    let mut opts = *opts;
    if opts.file_types_only && opts.type_filter.is_none() {
        opts.type_filter = sys.file_object_type_index(host.os_generation());
        if opts.type_filter.is_none() {
            reportln!(host, "Warning: could not get the object type index for files");
        }
    }

    let found = engine::search(&mut sys, host, target, &opts);
    *seed = sys.seed();
    found
}
