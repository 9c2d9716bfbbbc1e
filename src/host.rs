//! Collaborators the search engine borrows from its caller: the line sink,
//! the cancellation poll, string conversion and the OS version indicator.

/// Rough Windows generation, only consulted when the optional object-type
/// filter has to translate a type-table position into a type index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OsGeneration {
    PreWin7,
    Win7,
    Win81OrLater,
}

/// Environment a search runs in.
///
/// `report` receives the user-facing result lines; `report_verbose` receives
/// the chatty per-candidate diagnostics that are only interesting when
/// debugging a search. Cancellation is cooperative: the engine polls
/// [`SearchHost::cancelled`] once per candidate and stops at the next
/// iteration, it cannot interrupt an in-flight OS call.
pub trait SearchHost {
    fn report(&mut self, line: &str);

    fn report_verbose(&mut self, line: &str);

    fn cancelled(&self) -> bool {
        false
    }

    /// Convert the target name into the OS's native wide encoding.
    fn to_wide(&self, s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn os_generation(&self) -> OsGeneration {
        OsGeneration::Win81OrLater
    }
}

/// Host that forwards both sink tiers onto the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHost;

impl SearchHost for LogHost {
    fn report(&mut self, line: &str) {
        log::info!("{line}");
    }

    fn report_verbose(&mut self, line: &str) {
        log::debug!("{line}");
    }
}
