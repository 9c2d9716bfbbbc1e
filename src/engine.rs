//! The search engine proper: walk the system handle snapshot, bring each
//! foreign handle into this process, resolve its object name and report the
//! owners of every handle that matches the target.

use crate::{
    error::SearchError,
    host::SearchHost,
    reportln,
};

/// One open handle somewhere in the system, as captured by the snapshot.
///
/// The snapshot is observed to group records by owning process, and the
/// one-deep caches below lean on that adjacency, but nothing breaks when the
/// OS stops grouping: the engine merely reopens processes it has already
/// seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRecord {
    pub pid: u32,
    pub handle: u64,
    pub type_index: u16,
    pub granted_access: u32,
}

/// Point-in-time enumeration of every open handle across all processes.
#[derive(Debug, Default)]
pub struct HandleSnapshot {
    records: Vec<HandleRecord>,
}

impl HandleSnapshot {
    pub fn new(records: Vec<HandleRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HandleRecord> {
        self.records.iter()
    }
}

/// How a search behaves beyond the target name itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct SearchOptions {
    /// Match when the resolved name merely starts with the target.
    pub partial_match: bool,
    /// Skip handles owned by the calling process.
    pub ignore_self: bool,
    /// Resolve the system's `File` object-type index up front and only
    /// consider handles of that type. Off by default; the filter never
    /// showed a practical benefit.
    pub file_types_only: bool,
    /// Only consider handles with this object-type index. Normally left
    /// unset and filled in from `file_types_only`.
    pub type_filter: Option<u16>,
}

/// The target in wide form plus the match mode, fixed for one search.
struct MatchCriteria {
    target: Vec<u16>,
    partial: bool,
}

impl MatchCriteria {
    fn new(target: Vec<u16>, partial: bool) -> Self {
        Self { target, partial }
    }

    /// Exact mode wants equal lengths, partial mode a long-enough name; both
    /// want the leading characters ordinally equal.
    fn matches(&self, name: &[u16]) -> bool {
        let n = self.target.len();
        let length_ok = if self.partial {
            name.len() >= n
        } else {
            name.len() == n
        };
        length_ok && name[..n] == self.target[..]
    }
}

/// The last process id that refused to be opened, so adjacent handles of the
/// same inaccessible process cost one failed open instead of many.
#[derive(Debug, Default)]
struct AccessDeniedMemo(Option<u32>);

impl AccessDeniedMemo {
    fn hit(&self, pid: u32) -> bool {
        self.0 == Some(pid)
    }

    fn record(&mut self, pid: u32) {
        self.0 = Some(pid);
    }
}

/// The two most recently reported executable paths. Suppresses the immediate
/// repeats produced by a process holding several matching handles, without
/// suppressing a path that comes back after a different one.
#[derive(Debug, Default)]
struct ReportedPathRing {
    slots: [String; 2],
    cur: usize,
}

impl ReportedPathRing {
    /// Returns whether `path` should actually be printed.
    fn offer(&mut self, path: &str) -> bool {
        self.slots[self.cur] = path.to_owned();
        if self.slots[0] != self.slots[1] {
            self.cur ^= 1;
            true
        } else {
            false
        }
    }
}

/// The introspection surface the engine drives. The real implementation
/// lives in the `nt` module; tests substitute a scripted one.
///
/// Both associated types are owning guards: dropping them must release the
/// underlying OS handle, except for the distinguished self cases (the
/// current process pseudo-handle, and a handle borrowed straight out of the
/// caller's own handle table) which are not independently owned and must
/// never be closed.
pub trait System {
    type Process;
    type Object;

    fn current_pid(&self) -> u32;

    fn capture_handles(&mut self) -> Result<HandleSnapshot, SearchError>;

    /// Open a process for handle duplication and information queries. For
    /// the caller's own pid this yields the pseudo-handle, which costs
    /// nothing and closes nothing.
    fn open_process(&mut self, pid: u32) -> Result<Self::Process, SearchError>;

    /// Duplicate a handle owned by `owner` into the current process.
    fn duplicate(&mut self, owner: &Self::Process, raw: u64) -> Result<Self::Object, SearchError>;

    /// Wrap a handle already belonging to the current process, without
    /// taking ownership of it.
    fn borrow_own(&mut self, raw: u64) -> Self::Object;

    /// Whether the object is an on-disk file. Pipe, mailslot and device
    /// handles must be weeded out here: querying their names can block
    /// forever.
    fn is_disk_backed(&mut self, object: &Self::Object) -> bool;

    fn object_name(&mut self, object: &Self::Object) -> Result<Vec<u16>, SearchError>;

    fn executable_path(&mut self, owner: &Self::Process) -> Option<String>;
}

/// Search all processes and report the ones holding an open handle whose
/// object name matches `target`.
///
/// Returns whether at least one matching process was found. Emits a header
/// line on the first match, one line per distinct reported process and a
/// final summary line through `host`.
pub fn search<S: System, H: SearchHost>(
    sys: &mut S,
    host: &mut H,
    target: &str,
    opts: &SearchOptions,
) -> bool {
    let found = match run(sys, host, target, opts) {
        Ok(found) => found,
        Err(e) => {
            reportln!(host, "Warning: could not enumerate process handles: {e}");
            false
        }
    };

    if found {
        reportln!(
            host,
            "You should try to close these applications before attempting to reformat the drive."
        );
    } else {
        reportln!(
            host,
            "NOTE: was not able to identify the process(es) preventing access to {target}"
        );
    }
    found
}

fn run<S: System, H: SearchHost>(
    sys: &mut S,
    host: &mut H,
    target: &str,
    opts: &SearchOptions,
) -> Result<bool, SearchError> {
    let criteria = MatchCriteria::new(host.to_wide(target), opts.partial_match);
    let snapshot = sys.capture_handles()?;
    let self_pid = sys.current_pid();

    let mut found = false;
    let mut denied = AccessDeniedMemo::default();
    let mut reported = ReportedPathRing::default();
    // One-deep process handle cache; dropping the slot closes the handle.
    let mut owner: Option<(u32, S::Process)> = None;

    for record in snapshot.iter() {
        if host.cancelled() {
            host.report_verbose("search cancelled");
            break;
        }

        if let Some(wanted) = opts.type_filter {
            if record.type_index != wanted {
                continue;
            }
        }

        // Rotate the process slot as soon as the pid changes, so the
        // previous process handle is closed even when this candidate ends
        // up skipped.
        if !matches!(&owner, Some((pid, _)) if *pid == record.pid) {
            owner = None;
        }

        if denied.hit(record.pid) {
            continue;
        }

        if owner.is_none() {
            match sys.open_process(record.pid) {
                Ok(handle) => owner = Some((record.pid, handle)),
                Err(e) => {
                    host.report_verbose(&format!("could not open process {}: {e}", record.pid));
                    if let SearchError::AccessDenied { pid } = e {
                        denied.record(pid);
                    }
                    continue;
                }
            }
        }
        let Some((_, process)) = owner.as_ref() else {
            continue;
        };

        let object = if record.pid == self_pid {
            if opts.ignore_self {
                continue;
            }
            // Already ours; duplication is pointless and the raw value must
            // not be closed.
            sys.borrow_own(record.handle)
        } else {
            match sys.duplicate(process, record.handle) {
                Ok(object) => object,
                // Stale handles and undupable types are ordinary here.
                Err(_) => continue,
            }
        };

        if !sys.is_disk_backed(&object) {
            continue;
        }

        let name = match sys.object_name(&object) {
            Ok(name) => name,
            Err(e) => {
                host.report_verbose(&format!(
                    "name query failed for handle {:x} of process {}: {e}",
                    record.handle, record.pid
                ));
                continue;
            }
        };

        if !criteria.matches(&name) {
            continue;
        }

        if !found {
            reportln!(host, "NOTE: the following process(es) are accessing {target}:");
            found = true;
        }

        match sys.executable_path(process) {
            Some(path) => {
                if reported.offer(&path) {
                    reportln!(host, "o {path}");
                }
            }
            None => reportln!(host, "o Unknown (process id {})", record.pid),
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SearchError, STATUS_UNSUCCESSFUL};
    use std::{
        cell::RefCell,
        collections::HashMap,
        rc::Rc,
    };

    const SELF_PID: u32 = 77;

    /// Everything the mock counts, shared with the guards it hands out.
    #[derive(Default)]
    struct Counters {
        opens: Vec<u32>,
        dup_calls: usize,
        name_queries: usize,
        open_process_handles: usize,
        open_objects: usize,
    }

    struct MockProcess {
        pid: u32,
        owned: bool,
        counters: Rc<RefCell<Counters>>,
    }

    impl Drop for MockProcess {
        fn drop(&mut self) {
            let mut c = self.counters.borrow_mut();
            if self.owned {
                c.open_process_handles -= 1;
            }
        }
    }

    struct MockObject {
        raw: u64,
        owned: bool,
        counters: Rc<RefCell<Counters>>,
    }

    impl Drop for MockObject {
        fn drop(&mut self) {
            // Borrowed self handles are not counted as open, so a spurious
            // close would underflow and panic the test.
            if self.owned {
                self.counters.borrow_mut().open_objects -= 1;
            }
        }
    }

    #[derive(Clone)]
    struct ObjectSpec {
        name: &'static str,
        disk_backed: bool,
        dupable: bool,
    }

    fn file(name: &'static str) -> ObjectSpec {
        ObjectSpec {
            name,
            disk_backed: true,
            dupable: true,
        }
    }

    struct MockSystem {
        snapshot: Vec<HandleRecord>,
        objects: HashMap<(u32, u64), ObjectSpec>,
        denied_pids: Vec<u32>,
        paths: HashMap<u32, String>,
        capture_error: Option<SearchError>,
        counters: Rc<RefCell<Counters>>,
    }

    impl MockSystem {
        fn new() -> Self {
            Self {
                snapshot: Vec::new(),
                objects: HashMap::new(),
                denied_pids: Vec::new(),
                paths: HashMap::new(),
                capture_error: None,
                counters: Rc::default(),
            }
        }

        fn with_handle(mut self, pid: u32, handle: u64, spec: ObjectSpec) -> Self {
            self.snapshot.push(HandleRecord {
                pid,
                handle,
                type_index: 30,
                granted_access: 0x12019f,
            });
            self.objects.insert((pid, handle), spec);
            self
        }

        fn with_path(mut self, pid: u32, path: &str) -> Self {
            self.paths.insert(pid, path.to_owned());
            self
        }

        fn deny(mut self, pid: u32) -> Self {
            self.denied_pids.push(pid);
            self
        }
    }

    impl System for MockSystem {
        type Process = MockProcess;
        type Object = MockObject;

        fn current_pid(&self) -> u32 {
            SELF_PID
        }

        fn capture_handles(&mut self) -> Result<HandleSnapshot, SearchError> {
            if let Some(e) = self.capture_error.take() {
                return Err(e);
            }
            Ok(HandleSnapshot::new(self.snapshot.clone()))
        }

        fn open_process(&mut self, pid: u32) -> Result<MockProcess, SearchError> {
            let mut c = self.counters.borrow_mut();
            c.opens.push(pid);
            if self.denied_pids.contains(&pid) {
                return Err(SearchError::AccessDenied { pid });
            }
            let owned = pid != SELF_PID;
            if owned {
                c.open_process_handles += 1;
            }
            Ok(MockProcess {
                pid,
                owned,
                counters: Rc::clone(&self.counters),
            })
        }

        fn duplicate(&mut self, owner: &MockProcess, raw: u64) -> Result<MockObject, SearchError> {
            let mut c = self.counters.borrow_mut();
            c.dup_calls += 1;
            let spec = self.objects.get(&(owner.pid, raw));
            match spec {
                Some(spec) if spec.dupable => {
                    c.open_objects += 1;
                    Ok(MockObject {
                        raw,
                        owned: true,
                        counters: Rc::clone(&self.counters),
                    })
                }
                _ => Err(SearchError::ObjectUnresolvable {
                    status: STATUS_UNSUCCESSFUL,
                }),
            }
        }

        fn borrow_own(&mut self, raw: u64) -> MockObject {
            MockObject {
                raw,
                owned: false,
                counters: Rc::clone(&self.counters),
            }
        }

        fn is_disk_backed(&mut self, object: &MockObject) -> bool {
            self.lookup(object).disk_backed
        }

        fn object_name(&mut self, object: &MockObject) -> Result<Vec<u16>, SearchError> {
            self.counters.borrow_mut().name_queries += 1;
            Ok(self.lookup(object).name.encode_utf16().collect())
        }

        fn executable_path(&mut self, owner: &MockProcess) -> Option<String> {
            self.paths.get(&owner.pid).cloned()
        }
    }

    impl MockSystem {
        fn lookup(&self, object: &MockObject) -> ObjectSpec {
            self.objects
                .iter()
                .find(|((_, raw), _)| *raw == object.raw)
                .map(|(_, spec)| spec.clone())
                .expect("object spec registered")
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        lines: Vec<String>,
        verbose: Vec<String>,
        cancel_after: Option<usize>,
        polls: RefCell<usize>,
    }

    impl SearchHost for RecordingHost {
        fn report(&mut self, line: &str) {
            self.lines.push(line.to_owned());
        }

        fn report_verbose(&mut self, line: &str) {
            self.verbose.push(line.to_owned());
        }

        fn cancelled(&self) -> bool {
            let mut polls = self.polls.borrow_mut();
            *polls += 1;
            match self.cancel_after {
                Some(n) => *polls > n,
                None => false,
            }
        }
    }

    const TARGET: &str = r"\Device\HarddiskVolume3\file.txt";

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn exact_match_reports_owner() {
        init_logs();
        let mut sys = MockSystem::new()
            .with_handle(100, 0x44, file(TARGET))
            .with_path(100, r"C:\apps\editor.exe");
        let mut host = RecordingHost::default();

        let found = search(&mut sys, &mut host, TARGET, &SearchOptions::default());

        assert!(found);
        assert_eq!(
            host.lines,
            vec![
                format!("NOTE: the following process(es) are accessing {TARGET}:"),
                r"o C:\apps\editor.exe".to_owned(),
                "You should try to close these applications before attempting to reformat the drive."
                    .to_owned(),
            ]
        );
    }

    #[test]
    fn exact_match_rejects_trailing_difference() {
        let mut sys = MockSystem::new()
            .with_handle(100, 0x44, file(r"\Device\HarddiskVolume3\file.txu"))
            .with_path(100, r"C:\apps\editor.exe");
        let mut host = RecordingHost::default();

        let found = search(&mut sys, &mut host, TARGET, &SearchOptions::default());

        assert!(!found);
        assert_eq!(host.lines.len(), 1);
        assert!(host.lines[0].contains("not able to identify"));
    }

    #[test]
    fn exact_match_rejects_substring_of_longer_name() {
        let longer = r"\Device\HarddiskVolume3\file.txt.bak";
        let mut sys = MockSystem::new()
            .with_handle(100, 0x44, file(longer))
            .with_path(100, r"C:\apps\editor.exe");
        let mut host = RecordingHost::default();

        assert!(!search(&mut sys, &mut host, TARGET, &SearchOptions::default()));
    }

    #[test]
    fn partial_match_accepts_prefix() {
        let mut sys = MockSystem::new()
            .with_handle(100, 0x44, file(r"\Device\HarddiskVolume3\file.txt.bak"))
            .with_path(100, r"C:\apps\editor.exe");
        let mut host = RecordingHost::default();
        let opts = SearchOptions {
            partial_match: true,
            ..Default::default()
        };

        assert!(search(&mut sys, &mut host, TARGET, &opts));
    }

    #[test]
    fn partial_match_rejects_shorter_name() {
        let mut sys = MockSystem::new()
            .with_handle(100, 0x44, file(r"\Device\HarddiskVolume3\file.tx"))
            .with_path(100, r"C:\apps\editor.exe");
        let mut host = RecordingHost::default();
        let opts = SearchOptions {
            partial_match: true,
            ..Default::default()
        };

        assert!(!search(&mut sys, &mut host, TARGET, &opts));
    }

    #[test]
    fn access_denied_process_is_skipped_and_memoized() {
        let mut sys = MockSystem::new()
            .with_handle(200, 0x10, file(TARGET))
            .with_handle(200, 0x14, file(TARGET))
            .with_handle(200, 0x18, file(TARGET))
            .with_handle(300, 0x20, file(TARGET))
            .with_path(300, r"C:\apps\other.exe")
            .deny(200);
        let mut host = RecordingHost::default();

        let found = search(&mut sys, &mut host, TARGET, &SearchOptions::default());

        assert!(found);
        // One failed open for pid 200, then the memo short-circuits; pid 300
        // still gets scanned.
        let counters = sys.counters.borrow();
        assert_eq!(counters.opens, vec![200, 300]);
        assert!(host.lines.iter().any(|l| l.contains(r"other.exe")));
    }

    #[test]
    fn contiguous_records_share_one_process_open() {
        let mut sys = MockSystem::new()
            .with_handle(100, 0x10, file("a"))
            .with_handle(100, 0x14, file("b"))
            .with_handle(100, 0x18, file("c"))
            .with_handle(400, 0x20, file("d"))
            .with_handle(100, 0x1c, file("e"));
        let mut host = RecordingHost::default();

        search(&mut sys, &mut host, TARGET, &SearchOptions::default());

        // Reopened after the interleaved pid 400 run; adjacency is an
        // optimization, not a correctness requirement.
        let counters = sys.counters.borrow();
        assert_eq!(counters.opens, vec![100, 400, 100]);
        assert_eq!(counters.open_process_handles, 0, "all process handles closed");
        assert_eq!(counters.open_objects, 0, "all duplicated handles closed");
    }

    #[test]
    fn ignore_self_skips_own_handles_entirely() {
        let mut sys = MockSystem::new()
            .with_handle(SELF_PID, 0x30, file(TARGET))
            .with_path(SELF_PID, r"C:\apps\self.exe");
        let mut host = RecordingHost::default();
        let opts = SearchOptions {
            ignore_self: true,
            ..Default::default()
        };

        let found = search(&mut sys, &mut host, TARGET, &opts);

        assert!(!found);
        assert_eq!(sys.counters.borrow().dup_calls, 0);
    }

    #[test]
    fn own_handles_are_borrowed_not_duplicated() {
        let mut sys = MockSystem::new()
            .with_handle(SELF_PID, 0x30, file(TARGET))
            .with_path(SELF_PID, r"C:\apps\self.exe");
        let mut host = RecordingHost::default();

        let found = search(&mut sys, &mut host, TARGET, &SearchOptions::default());

        assert!(found);
        let counters = sys.counters.borrow();
        assert_eq!(counters.dup_calls, 0, "self handles are used raw");
        assert_eq!(counters.open_objects, 0);
    }

    #[test]
    fn undupable_handle_is_skipped_quietly() {
        let mut sys = MockSystem::new()
            .with_handle(
                100,
                0x44,
                ObjectSpec {
                    name: TARGET,
                    disk_backed: true,
                    dupable: false,
                },
            )
            .with_handle(500, 0x48, file(TARGET))
            .with_path(500, r"C:\apps\viewer.exe");
        let mut host = RecordingHost::default();

        let found = search(&mut sys, &mut host, TARGET, &SearchOptions::default());

        assert!(found);
        assert!(host.verbose.is_empty(), "duplication failures are not logged");
    }

    #[test]
    fn non_disk_handle_never_reaches_name_query() {
        let mut sys = MockSystem::new().with_handle(
            100,
            0x44,
            ObjectSpec {
                name: TARGET,
                disk_backed: false,
                dupable: true,
            },
        );
        let mut host = RecordingHost::default();

        let found = search(&mut sys, &mut host, TARGET, &SearchOptions::default());

        assert!(!found);
        assert_eq!(sys.counters.borrow().name_queries, 0);
    }

    #[test]
    fn consecutive_identical_paths_print_once() {
        let mut sys = MockSystem::new()
            .with_handle(100, 0x10, file(TARGET))
            .with_handle(100, 0x14, file(TARGET))
            .with_path(100, r"C:\apps\editor.exe");
        let mut host = RecordingHost::default();

        search(&mut sys, &mut host, TARGET, &SearchOptions::default());

        let path_lines: Vec<_> = host.lines.iter().filter(|l| l.starts_with("o ")).collect();
        assert_eq!(path_lines.len(), 1);
    }

    #[test]
    fn path_reappearing_after_another_prints_again() {
        let mut sys = MockSystem::new()
            .with_handle(100, 0x10, file(TARGET))
            .with_handle(200, 0x14, file(TARGET))
            .with_handle(100, 0x18, file(TARGET))
            .with_path(100, r"C:\apps\a.exe")
            .with_path(200, r"C:\apps\b.exe");
        let mut host = RecordingHost::default();

        search(&mut sys, &mut host, TARGET, &SearchOptions::default());

        let path_lines: Vec<_> = host.lines.iter().filter(|l| l.starts_with("o ")).collect();
        assert_eq!(
            path_lines,
            vec![r"o C:\apps\a.exe", r"o C:\apps\b.exe", r"o C:\apps\a.exe"]
        );
    }

    #[test]
    fn unresolvable_path_reports_pid() {
        let mut sys = MockSystem::new().with_handle(100, 0x10, file(TARGET));
        let mut host = RecordingHost::default();

        let found = search(&mut sys, &mut host, TARGET, &SearchOptions::default());

        assert!(found);
        assert!(host.lines.iter().any(|l| l == "o Unknown (process id 100)"));
    }

    #[test]
    fn snapshot_failure_aborts_without_partial_reports() {
        init_logs();
        let mut sys = MockSystem::new()
            .with_handle(100, 0x10, file(TARGET))
            .with_path(100, r"C:\apps\editor.exe");
        sys.capture_error = Some(SearchError::ResourceExhausted {
            what: "handle snapshot buffer",
        });
        let mut host = RecordingHost::default();

        let found = search(&mut sys, &mut host, TARGET, &SearchOptions::default());

        assert!(!found);
        assert!(host.lines[0].starts_with("Warning: could not enumerate process handles"));
        assert!(!host.lines.iter().any(|l| l.starts_with("o ")));
        assert!(host.lines.last().unwrap().contains("not able to identify"));
    }

    #[test]
    fn cancellation_stops_the_scan_early() {
        let mut sys = MockSystem::new()
            .with_handle(100, 0x10, file(TARGET))
            .with_handle(200, 0x14, file(TARGET))
            .with_path(100, r"C:\apps\a.exe")
            .with_path(200, r"C:\apps\b.exe");
        let mut host = RecordingHost {
            cancel_after: Some(1),
            ..Default::default()
        };

        let found = search(&mut sys, &mut host, TARGET, &SearchOptions::default());

        // The first candidate was reported before the poll tripped.
        assert!(found);
        assert!(host.lines.iter().any(|l| l.contains(r"a.exe")));
        assert!(!host.lines.iter().any(|l| l.contains(r"b.exe")));
        assert_eq!(sys.counters.borrow().open_process_handles, 0);
    }

    #[test]
    fn type_filter_drops_other_indices() {
        let mut sys = MockSystem::new()
            .with_handle(100, 0x10, file(TARGET))
            .with_path(100, r"C:\apps\editor.exe");
        let mut host = RecordingHost::default();
        let opts = SearchOptions {
            type_filter: Some(99),
            ..Default::default()
        };

        let found = search(&mut sys, &mut host, TARGET, &opts);

        assert!(!found);
        assert!(sys.counters.borrow().opens.is_empty());
    }

    #[test]
    fn match_criteria_is_case_sensitive() {
        let criteria = MatchCriteria::new("abc".encode_utf16().collect(), false);
        assert!(criteria.matches(&"abc".encode_utf16().collect::<Vec<_>>()));
        assert!(!criteria.matches(&"Abc".encode_utf16().collect::<Vec<_>>()));
    }

    #[test]
    fn ring_keeps_two_slots() {
        let mut ring = ReportedPathRing::default();
        assert!(ring.offer("a"));
        assert!(!ring.offer("a"));
        assert!(ring.offer("b"));
        assert!(ring.offer("a"));
    }
}
