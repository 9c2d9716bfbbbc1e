//! The real introspection layer: ntdll entry points resolved by name at
//! startup, the raw NT structures behind them and the [`System`]
//! implementation the search engine drives.

use std::{ffi::c_void, mem, ptr};

use windows::{
    core::{s, PCSTR},
    Win32::{
        Foundation::{HANDLE, HMODULE, NTSTATUS, UNICODE_STRING},
        Storage::FileSystem::{GetFileType, FILE_TYPE_DISK},
        System::{
            LibraryLoader::{GetModuleHandleA, GetProcAddress},
            ProcessStatus::GetModuleFileNameExW,
            Threading::{
                GetCurrentProcess, GetCurrentProcessId, PROCESS_DUP_HANDLE,
                PROCESS_QUERY_INFORMATION,
            },
        },
    },
};

use crate::{
    buffers::{
        name_query_loop, snapshot_probe_loop, NameProbe, SnapshotProbe, SnapshotSeed,
        NAME_BUFFER_INITIAL_SIZE, NAME_QUERY_ATTEMPTS, SNAPSHOT_CEILING,
    },
    engine::{HandleRecord, HandleSnapshot, System},
    error::{
        SearchError, STATUS_BUFFER_OVERFLOW, STATUS_BUFFER_TOO_SMALL,
        STATUS_INFO_LENGTH_MISMATCH, STATUS_UNSUCCESSFUL,
    },
    host::OsGeneration,
};

mod arena;
pub use arena::{Arena, ArenaBox};

const SYSTEM_EXTENDED_HANDLE_INFORMATION: u32 = 64;
const OBJECT_NAME_INFORMATION_CLASS: u32 = 1;
const OBJECT_TYPES_INFORMATION_CLASS: u32 = 3;

pub(crate) type NtQuerySystemInformationFn =
    unsafe extern "system" fn(u32, *mut c_void, u32, *mut u32) -> NTSTATUS;
pub(crate) type NtQueryObjectFn =
    unsafe extern "system" fn(HANDLE, u32, *mut c_void, u32, *mut u32) -> NTSTATUS;
pub(crate) type NtDuplicateObjectFn =
    unsafe extern "system" fn(HANDLE, HANDLE, HANDLE, *mut HANDLE, u32, u32, u32) -> NTSTATUS;
pub(crate) type NtOpenProcessFn =
    unsafe extern "system" fn(*mut HANDLE, u32, *const ObjectAttributes, *const ClientId) -> NTSTATUS;
pub(crate) type NtCloseFn = unsafe extern "system" fn(HANDLE) -> NTSTATUS;
pub(crate) type RtlCreateHeapFn = unsafe extern "system" fn(
    u32,
    *mut c_void,
    usize,
    usize,
    *mut c_void,
    *mut c_void,
) -> *mut c_void;
pub(crate) type RtlDestroyHeapFn = unsafe extern "system" fn(*mut c_void) -> *mut c_void;
pub(crate) type RtlAllocateHeapFn = unsafe extern "system" fn(*mut c_void, u32, usize) -> *mut c_void;
pub(crate) type RtlFreeHeapFn = unsafe extern "system" fn(*mut c_void, u32, *mut c_void) -> u8;

#[repr(C)]
pub(crate) struct ObjectAttributes {
    length: u32,
    root_directory: HANDLE,
    object_name: *const c_void,
    attributes: u32,
    security_descriptor: *const c_void,
    security_quality_of_service: *const c_void,
}

impl ObjectAttributes {
    fn empty() -> Self {
        Self {
            length: mem::size_of::<Self>() as u32,
            root_directory: HANDLE(0),
            object_name: ptr::null(),
            attributes: 0,
            security_descriptor: ptr::null(),
            security_quality_of_service: ptr::null(),
        }
    }
}

#[repr(C)]
pub(crate) struct ClientId {
    unique_process: HANDLE,
    unique_thread: HANDLE,
}

#[repr(C)]
struct SystemHandleInformationEx {
    number_of_handles: usize,
    reserved: usize,
    // Entries follow.
}

#[repr(C)]
struct SystemHandleTableEntryInfoEx {
    object: *mut c_void,
    unique_process_id: usize,
    handle_value: usize,
    granted_access: u32,
    creator_back_trace_index: u16,
    object_type_index: u16,
    handle_attributes: u32,
    reserved: u32,
}

#[repr(C)]
struct ObjectNameInformation {
    name: UNICODE_STRING,
    // The name characters follow.
}

#[repr(C)]
struct ObjectTypesInformation {
    number_of_types: u32,
    // Entries follow, each aligned to a pointer boundary.
}

#[repr(C)]
struct ObjectTypeInformation {
    type_name: UNICODE_STRING,
    total_number_of_objects: u32,
    total_number_of_handles: u32,
    total_paged_pool_usage: u32,
    total_non_paged_pool_usage: u32,
    total_name_pool_usage: u32,
    total_handle_table_usage: u32,
    high_water_number_of_objects: u32,
    high_water_number_of_handles: u32,
    high_water_paged_pool_usage: u32,
    high_water_non_paged_pool_usage: u32,
    high_water_name_pool_usage: u32,
    high_water_handle_table_usage: u32,
    invalid_attributes: u32,
    generic_mapping: [u32; 4],
    valid_access_mask: u32,
    security_required: u8,
    maintain_handle_count: u8,
    type_index: u8,
    reserved_byte: i8,
    pool_type: u32,
    default_paged_pool_charge: u32,
    default_non_paged_pool_charge: u32,
}

fn align_up(n: usize) -> usize {
    let a = mem::size_of::<usize>();
    (n + a - 1) & !(a - 1)
}

macro_rules! capabilities {
    ($($field:ident : $ty:ty = $name:literal),* $(,)?) => {
        /// The ntdll entry points the search relies on, each present or
        /// absent. A user of a missing capability fails with
        /// `CapabilityUnavailable` instead of dereferencing a null pointer.
        pub struct Capabilities {
            $($field: Option<$ty>,)*
        }

        impl Capabilities {
            pub fn resolve() -> Self {
                let ntdll = unsafe { GetModuleHandleA(s!("ntdll.dll")) }.ok();
                $(
                    let $field = ntdll.and_then(|module| unsafe {
                        GetProcAddress(
                            module,
                            PCSTR::from_raw(concat!($name, "\0").as_ptr()),
                        )
                        .map(|p| mem::transmute::<_, $ty>(p))
                    });
                    if $field.is_none() {
                        log::warn!("could not resolve ntdll!{}", $name);
                    }
                )*
                Self { $($field,)* }
            }

            $(
                pub(crate) fn $field(&self) -> Result<$ty, SearchError> {
                    self.$field.ok_or(SearchError::CapabilityUnavailable($name))
                }
            )*
        }
    };
}

capabilities! {
    nt_query_system_information: NtQuerySystemInformationFn = "NtQuerySystemInformation",
    nt_query_object: NtQueryObjectFn = "NtQueryObject",
    nt_duplicate_object: NtDuplicateObjectFn = "NtDuplicateObject",
    nt_open_process: NtOpenProcessFn = "NtOpenProcess",
    nt_close: NtCloseFn = "NtClose",
    rtl_create_heap: RtlCreateHeapFn = "RtlCreateHeap",
    rtl_destroy_heap: RtlDestroyHeapFn = "RtlDestroyHeap",
    rtl_allocate_heap: RtlAllocateHeapFn = "RtlAllocateHeap",
    rtl_free_heap: RtlFreeHeapFn = "RtlFreeHeap",
}

/// An open handle to some process. The caller's own process is represented
/// by the pseudo-handle, which must never be closed.
pub struct ProcessHandle {
    raw: HANDLE,
    close: Option<NtCloseFn>,
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(close) = self.close {
            unsafe {
                close(self.raw);
            }
        }
    }
}

/// A handle usable in this process: either duplicated here (owned, closed on
/// drop) or borrowed straight from our own handle table (never closed).
pub struct LocalHandle {
    raw: HANDLE,
    close: Option<NtCloseFn>,
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        if let Some(close) = self.close {
            unsafe {
                close(self.raw);
            }
        }
    }
}

/// The live system, seen through the dynamically resolved NT APIs.
///
/// Single-threaded by construction: the arena heap is non-serialized, so one
/// `NtSystem` serves exactly one search at a time.
pub struct NtSystem {
    // Declared before the arena so the buffer is freed before the heap is
    // destroyed.
    name_buf: ArenaBox,
    arena: Arena,
    caps: Capabilities,
    seed: SnapshotSeed,
    self_pid: u32,
}

impl NtSystem {
    pub fn new(seed: SnapshotSeed) -> Result<Self, SearchError> {
        let caps = Capabilities::resolve();
        let arena = Arena::open(&caps)?;
        let name_buf = arena.alloc(NAME_BUFFER_INITIAL_SIZE)?;
        Ok(Self {
            name_buf,
            arena,
            caps,
            seed,
            self_pid: unsafe { GetCurrentProcessId() },
        })
    }

    /// The adaptive snapshot seed after this search, for the caller to carry
    /// into the next one.
    pub fn seed(&self) -> SnapshotSeed {
        self.seed
    }

    /// Look up the object-type index of on-disk `File` objects, for the
    /// optional type filter. Before Windows 8.1 the enumeration does not
    /// report indices, so the position in the table stands in, off by an
    /// amount that changed in Windows 7.
    pub fn file_object_type_index(&mut self, generation: OsGeneration) -> Option<u16> {
        const FILE_TYPE_NAME: [u16; 4] = [b'F' as u16, b'i' as u16, b'l' as u16, b'e' as u16];

        let query = match self.caps.nt_query_object() {
            Ok(f) => f,
            Err(e) => {
                log::warn!("cannot enumerate object types: {e}");
                return None;
            }
        };

        let arena = &self.arena;
        let mut buf: Option<ArenaBox> = None;
        let outcome = snapshot_probe_loop(0x1000, SNAPSHOT_CEILING, |size| {
            let mut b = arena.alloc(size)?;
            let mut returned = 0u32;
            let status = unsafe {
                query(
                    HANDLE(0),
                    OBJECT_TYPES_INFORMATION_CLASS,
                    b.as_mut_ptr().cast(),
                    size as u32,
                    &mut returned,
                )
            };
            Ok(match status.0 {
                STATUS_INFO_LENGTH_MISMATCH => SnapshotProbe::Grow,
                code if code >= 0 => {
                    buf = Some(b);
                    SnapshotProbe::Done
                }
                code => SnapshotProbe::Fail(code),
            })
        });
        if let Err(e) = outcome {
            log::warn!("object type enumeration failed: {e}");
            return None;
        }
        let buf = buf?;

        unsafe {
            let count = (*buf.as_ptr().cast::<ObjectTypesInformation>()).number_of_types as usize;
            let end = buf.as_ptr().add(buf.len());
            let mut cursor = buf
                .as_ptr()
                .add(align_up(mem::size_of::<ObjectTypesInformation>()));

            for position in 0..count {
                if cursor.add(mem::size_of::<ObjectTypeInformation>()) > end {
                    break;
                }
                let info = &*cursor.cast::<ObjectTypeInformation>();
                if !info.type_name.Buffer.is_null() {
                    let chars = (info.type_name.Length / 2) as usize;
                    let name = std::slice::from_raw_parts(info.type_name.Buffer.0, chars);
                    if name == FILE_TYPE_NAME {
                        return Some(match generation {
                            OsGeneration::Win81OrLater => info.type_index as u16,
                            OsGeneration::Win7 => position as u16 + 2,
                            OsGeneration::PreWin7 => position as u16 + 1,
                        });
                    }
                }
                cursor = cursor.add(
                    mem::size_of::<ObjectTypeInformation>()
                        + align_up(info.type_name.MaximumLength as usize),
                );
            }
        }

        log::warn!("no File entry in the object type enumeration");
        None
    }
}

fn parse_snapshot(buf: &ArenaBox) -> HandleSnapshot {
    let header_size = mem::size_of::<SystemHandleInformationEx>();
    let entry_size = mem::size_of::<SystemHandleTableEntryInfoEx>();
    if buf.len() < header_size {
        return HandleSnapshot::default();
    }

    unsafe {
        let declared = (*buf.as_ptr().cast::<SystemHandleInformationEx>()).number_of_handles;
        // Never trust the declared count past what the buffer actually holds.
        let count = declared.min((buf.len() - header_size) / entry_size);
        let first = buf
            .as_ptr()
            .add(header_size)
            .cast::<SystemHandleTableEntryInfoEx>();

        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let entry = &*first.add(i);
            records.push(HandleRecord {
                pid: entry.unique_process_id as u32,
                handle: entry.handle_value as u64,
                type_index: entry.object_type_index,
                granted_access: entry.granted_access,
            });
        }
        HandleSnapshot::new(records)
    }
}

impl System for NtSystem {
    type Process = ProcessHandle;
    type Object = LocalHandle;

    fn current_pid(&self) -> u32 {
        self.self_pid
    }

    fn capture_handles(&mut self) -> Result<HandleSnapshot, SearchError> {
        let query = self.caps.nt_query_system_information()?;
        let arena = &self.arena;
        let mut buf: Option<ArenaBox> = None;

        let final_size = snapshot_probe_loop(self.seed.initial(), SNAPSHOT_CEILING, |size| {
            let mut b = arena.alloc(size)?;
            let status = unsafe {
                query(
                    SYSTEM_EXTENDED_HANDLE_INFORMATION,
                    b.as_mut_ptr().cast(),
                    size as u32,
                    ptr::null_mut(),
                )
            };
            Ok(match status.0 {
                STATUS_INFO_LENGTH_MISMATCH => SnapshotProbe::Grow,
                code if code >= 0 => {
                    buf = Some(b);
                    SnapshotProbe::Done
                }
                code => SnapshotProbe::Fail(code),
            })
        })?;
        self.seed.remember(final_size);

        let Some(buf) = buf else {
            return Err(SearchError::SnapshotFailed {
                status: STATUS_UNSUCCESSFUL,
            });
        };
        let snapshot = parse_snapshot(&buf);
        log::debug!(
            "captured {} handles in a {final_size} byte snapshot",
            snapshot.len()
        );
        Ok(snapshot)
    }

    fn open_process(&mut self, pid: u32) -> Result<ProcessHandle, SearchError> {
        if pid == self.self_pid {
            return Ok(ProcessHandle {
                raw: unsafe { GetCurrentProcess() },
                close: None,
            });
        }

        let open = self.caps.nt_open_process()?;
        let close = self.caps.nt_close()?;

        let mut raw = HANDLE(0);
        let attributes = ObjectAttributes::empty();
        let client_id = ClientId {
            unique_process: HANDLE(pid as isize),
            unique_thread: HANDLE(0),
        };
        let status = unsafe {
            open(
                &mut raw,
                (PROCESS_DUP_HANDLE | PROCESS_QUERY_INFORMATION).0,
                &attributes,
                &client_id,
            )
        };
        match status.0 {
            code if code >= 0 => Ok(ProcessHandle {
                raw,
                close: Some(close),
            }),
            crate::error::STATUS_ACCESS_DENIED => Err(SearchError::AccessDenied { pid }),
            code => Err(SearchError::ObjectUnresolvable { status: code }),
        }
    }

    fn duplicate(&mut self, owner: &ProcessHandle, raw: u64) -> Result<LocalHandle, SearchError> {
        let dup = self.caps.nt_duplicate_object()?;
        let close = self.caps.nt_close()?;

        let mut local = HANDLE(0);
        let status = unsafe {
            dup(
                owner.raw,
                HANDLE(raw as isize),
                GetCurrentProcess(),
                &mut local,
                0,
                0,
                0,
            )
        };
        if status.0 >= 0 {
            Ok(LocalHandle {
                raw: local,
                close: Some(close),
            })
        } else {
            Err(SearchError::ObjectUnresolvable { status: status.0 })
        }
    }

    fn borrow_own(&mut self, raw: u64) -> LocalHandle {
        LocalHandle {
            raw: HANDLE(raw as isize),
            close: None,
        }
    }

    fn is_disk_backed(&mut self, object: &LocalHandle) -> bool {
        unsafe { GetFileType(object.raw) == FILE_TYPE_DISK }
    }

    fn object_name(&mut self, object: &LocalHandle) -> Result<Vec<u16>, SearchError> {
        let query = self.caps.nt_query_object()?;
        let arena = &self.arena;
        let buf = &mut self.name_buf;
        let raw = object.raw;

        let chars = name_query_loop(NAME_QUERY_ATTEMPTS, buf.len(), |size| {
            if size != buf.len() {
                // The OS wants a different size; the buffer is replaced, not
                // resized in place.
                *buf = arena.alloc(size)?;
            }
            let mut returned = 0u32;
            let status = unsafe {
                query(
                    raw,
                    OBJECT_NAME_INFORMATION_CLASS,
                    buf.as_mut_ptr().cast(),
                    buf.len() as u32,
                    &mut returned,
                )
            };
            Ok(match status.0 {
                STATUS_BUFFER_OVERFLOW | STATUS_INFO_LENGTH_MISMATCH | STATUS_BUFFER_TOO_SMALL => {
                    NameProbe::Grow(returned as usize)
                }
                code if code >= 0 => {
                    let info = unsafe { &*buf.as_ptr().cast::<ObjectNameInformation>() };
                    NameProbe::Done((info.name.Length / 2) as usize)
                }
                code => NameProbe::Fail(code),
            })
        })?;

        unsafe {
            let info = &*self.name_buf.as_ptr().cast::<ObjectNameInformation>();
            let capacity = self
                .name_buf
                .len()
                .saturating_sub(mem::size_of::<ObjectNameInformation>())
                / 2;
            let chars = chars.min(capacity);
            if chars == 0 || info.name.Buffer.is_null() {
                return Ok(Vec::new());
            }
            Ok(std::slice::from_raw_parts(info.name.Buffer.0, chars).to_vec())
        }
    }

    fn executable_path(&mut self, owner: &ProcessHandle) -> Option<String> {
        let mut path = [0u16; 260];
        let len = unsafe { GetModuleFileNameExW(owner.raw, HMODULE(0), &mut path) } as usize;
        (len > 0).then(|| String::from_utf16_lossy(&path[..len]))
    }
}
