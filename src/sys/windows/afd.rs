//! The `\Device\Afd` poll channel.
//!
//! Opening `\Device\Afd` without extended attributes yields a handle that
//! talks to the AFD driver without an associated endpoint; a single
//! `IOCTL_AFD_POLL` against it covers any number of base socket handles.
//! The ioctl's input and output share the `AFD_POLL_INFO` layout, so this
//! device keeps a per-request kernel-layout mirror of the driver's
//! descriptor buffers and copies outcomes back when the completion is
//! consumed.

use std::alloc::{self, Layout};
use std::cell::{RefCell, UnsafeCell};
use std::collections::HashMap;
use std::ffi::c_void;
use std::io;
use std::mem;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::OnceLock;

use windows_sys::Win32::Foundation::{
    CloseHandle, HANDLE, HINSTANCE, NTSTATUS, STATUS_CANCELLED, STATUS_NOT_FOUND, STATUS_PENDING,
    STATUS_SUCCESS, UNICODE_STRING,
};
use windows_sys::Win32::Storage::FileSystem::{
    FILE_OPEN, FILE_SHARE_READ, FILE_SHARE_WRITE, SYNCHRONIZE, SetFileCompletionNotificationModes,
};
use windows_sys::Win32::System::IO::CreateIoCompletionPort;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};
use windows_sys::Win32::System::WindowsProgramming::{
    FILE_SKIP_SET_EVENT_ON_HANDLE, IO_STATUS_BLOCK, OBJECT_ATTRIBUTES, PIO_APC_ROUTINE,
};

use crate::device::{
    CompletionStatus, Cookie, PollDevice, PollEntry, PollRequest, StatusBlock, SubmitOutcome,
};
use crate::events::Readiness;

use super::iocp::IocpQueue;

const IOCTL_AFD_POLL: u32 = 0x0001_2024;

#[repr(C)]
struct AfdPollHandleInfo {
    handle: usize,
    events: u32,
    status: NTSTATUS,
}

#[repr(C)]
struct AfdPollInfoHeader {
    timeout: i64,
    number_of_handles: u32,
    exclusive: u32,
}

/// Dynamically resolved ntdll entry points.
#[allow(non_snake_case)]
struct NtdllImports {
    NtCreateFile: unsafe extern "system" fn(
        file_handle: *mut HANDLE,
        desired_access: u32,
        object_attributes: *mut OBJECT_ATTRIBUTES,
        io_status_block: *mut IO_STATUS_BLOCK,
        allocation_size: *mut i64,
        file_attributes: u32,
        share_access: u32,
        create_disposition: u32,
        create_options: u32,
        ea_buffer: *mut c_void,
        ea_length: u32,
    ) -> NTSTATUS,
    NtDeviceIoControlFile: unsafe extern "system" fn(
        file_handle: HANDLE,
        event: HANDLE,
        apc_routine: PIO_APC_ROUTINE,
        apc_context: *mut c_void,
        io_status_block: *mut IO_STATUS_BLOCK,
        io_control_code: u32,
        input_buffer: *mut c_void,
        input_buffer_length: u32,
        output_buffer: *mut c_void,
        output_buffer_length: u32,
    ) -> NTSTATUS,
    NtCancelIoFileEx: unsafe extern "system" fn(
        file_handle: HANDLE,
        io_request_to_cancel: *mut IO_STATUS_BLOCK,
        io_status_block: *mut IO_STATUS_BLOCK,
    ) -> NTSTATUS,
    RtlNtStatusToDosError: unsafe extern "system" fn(status: NTSTATUS) -> u32,
}

impl NtdllImports {
    unsafe fn load(ntdll: HINSTANCE) -> io::Result<NtdllImports> {
        macro_rules! resolve {
            ($name:ident) => {{
                let name = concat!(stringify!($name), "\0");
                let addr = unsafe { GetProcAddress(ntdll, name.as_ptr()) };
                match addr {
                    Some(addr) => unsafe { mem::transmute(addr) },
                    None => return Err(io::Error::last_os_error()),
                }
            }};
        }
        Ok(NtdllImports {
            NtCreateFile: resolve!(NtCreateFile),
            NtDeviceIoControlFile: resolve!(NtDeviceIoControlFile),
            NtCancelIoFileEx: resolve!(NtCancelIoFileEx),
            RtlNtStatusToDosError: resolve!(RtlNtStatusToDosError),
        })
    }

    fn get() -> io::Result<&'static NtdllImports> {
        static IMPORTS: OnceLock<Option<NtdllImports>> = OnceLock::new();
        IMPORTS
            .get_or_init(|| unsafe {
                let ntdll = GetModuleHandleA(c"ntdll".as_ptr() as *const u8);
                if ntdll == 0 {
                    return None;
                }
                NtdllImports::load(ntdll).ok()
            })
            .as_ref()
            .ok_or_else(|| io::Error::other("ntdll imports unavailable"))
    }
}

pub(crate) fn nt_status_to_io_error(status: NTSTATUS) -> io::Error {
    match NtdllImports::get() {
        Ok(nt) => {
            let code = unsafe { (nt.RtlNtStatusToDosError)(status) };
            io::Error::from_raw_os_error(code as i32)
        }
        Err(e) => e,
    }
}

/// One `AFD_POLL_INFO` allocation: header plus a trailing entry array,
/// contiguous and address-stable so the kernel can own it for the
/// duration of a request.
struct PollInfoBuf {
    ptr: NonNull<u8>,
    layout: Layout,
    entries_offset: usize,
    capacity: usize,
}

impl PollInfoBuf {
    fn new(capacity: usize) -> PollInfoBuf {
        let header = Layout::new::<AfdPollInfoHeader>();
        let entries = Layout::array::<AfdPollHandleInfo>(capacity.max(1)).expect("layout");
        let (layout, entries_offset) = header.extend(entries).expect("layout");
        let layout = layout.pad_to_align();
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };
        PollInfoBuf {
            ptr,
            layout,
            entries_offset,
            capacity: capacity.max(1),
        }
    }

    fn header_mut(&mut self) -> &mut AfdPollInfoHeader {
        unsafe { &mut *(self.ptr.as_ptr() as *mut AfdPollInfoHeader) }
    }

    fn header(&self) -> &AfdPollInfoHeader {
        unsafe { &*(self.ptr.as_ptr() as *const AfdPollInfoHeader) }
    }

    fn entries_mut(&mut self) -> &mut [AfdPollHandleInfo] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(self.entries_offset) as *mut AfdPollHandleInfo,
                self.capacity,
            )
        }
    }

    fn entries(&self) -> &[AfdPollHandleInfo] {
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.as_ptr().add(self.entries_offset) as *const AfdPollHandleInfo,
                self.capacity,
            )
        }
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        self.ptr.as_ptr() as *mut c_void
    }

    fn size(&self) -> u32 {
        self.layout.size() as u32
    }

    fn zero(&mut self) {
        unsafe {
            ptr::write_bytes(self.ptr.as_ptr(), 0, self.layout.size());
        }
    }
}

impl Drop for PollInfoBuf {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

/// Kernel-layout mirror of one in-flight request.
struct AfdRequest {
    request: PollRequest,
    input: PollInfoBuf,
    output: PollInfoBuf,
    iosb: Box<UnsafeCell<IO_STATUS_BLOCK>>,
}

/// A poll channel on the AFD driver, bound to one [`IocpQueue`].
pub struct AfdDevice {
    afd: HANDLE,
    tag: u64,
    requests: RefCell<HashMap<Cookie, AfdRequest>>,
}

impl AfdDevice {
    /// Open an AFD handle and associate it with `queue`.
    pub fn new(queue: &IocpQueue) -> io::Result<Rc<AfdDevice>> {
        let nt = NtdllImports::get()?;

        // Any name below \Device\Afd works; the suffix only shows up in
        // handle dumps.
        let mut device_name: Vec<u16> = "\\Device\\Afd\\afdio".encode_utf16().collect();
        let name_bytes = (device_name.len() * 2) as u16;
        let mut name = UNICODE_STRING {
            Length: name_bytes,
            MaximumLength: name_bytes,
            Buffer: device_name.as_mut_ptr(),
        };
        let mut attributes = OBJECT_ATTRIBUTES {
            Length: mem::size_of::<OBJECT_ATTRIBUTES>() as u32,
            RootDirectory: 0,
            ObjectName: &mut name,
            Attributes: 0,
            SecurityDescriptor: ptr::null_mut(),
            SecurityQualityOfService: ptr::null_mut(),
        };
        let mut iosb: IO_STATUS_BLOCK = unsafe { mem::zeroed() };
        let mut afd: HANDLE = 0;

        let status = unsafe {
            (nt.NtCreateFile)(
                &mut afd,
                SYNCHRONIZE,
                &mut attributes,
                &mut iosb,
                ptr::null_mut(),
                0,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                FILE_OPEN,
                0,
                ptr::null_mut(),
                0,
            )
        };
        if status != STATUS_SUCCESS {
            return Err(nt_status_to_io_error(status));
        }

        let tag = queue.allocate_tag();
        let associated = unsafe { CreateIoCompletionPort(afd, queue.raw(), tag as usize, 0) };
        if associated == 0 {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(afd) };
            return Err(err);
        }
        // Skip-on-success is left off: a synchronously satisfied poll
        // still posts its packet, so submit reports those as pending and
        // lets the queue deliver them.
        if unsafe { SetFileCompletionNotificationModes(afd, FILE_SKIP_SET_EVENT_ON_HANDLE as u8) }
            == 0
        {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(afd) };
            return Err(err);
        }

        Ok(Rc::new(AfdDevice {
            afd,
            tag,
            requests: RefCell::new(HashMap::new()),
        }))
    }
}

impl PollDevice for AfdDevice {
    fn tag(&self) -> u64 {
        self.tag
    }

    fn submit(&self, request: &PollRequest) -> io::Result<SubmitOutcome> {
        let nt = NtdllImports::get()?;
        let capacity = request.input.borrow().capacity();
        let mut staged = AfdRequest {
            request: request.clone(),
            input: PollInfoBuf::new(capacity),
            output: PollInfoBuf::new(capacity),
            iosb: Box::new(UnsafeCell::new(unsafe { mem::zeroed() })),
        };

        {
            let input = request.input.borrow();
            let header = staged.input.header_mut();
            header.timeout = input.timeout;
            header.number_of_handles = input.len() as u32;
            header.exclusive = input.exclusive as u32;
            let entries = staged.input.entries_mut();
            for (i, entry) in input.entries().iter().enumerate() {
                entries[i] = AfdPollHandleInfo {
                    handle: entry.handle as usize,
                    events: entry.events.bits(),
                    status: entry.status,
                };
            }
        }
        staged.output.zero();

        let status = unsafe {
            (nt.NtDeviceIoControlFile)(
                self.afd,
                0,
                None,
                request.cookie as *mut c_void,
                staged.iosb.get(),
                IOCTL_AFD_POLL,
                staged.input.as_mut_ptr(),
                staged.input.size(),
                staged.output.as_mut_ptr(),
                staged.output.size(),
            )
        };
        match status {
            STATUS_PENDING | STATUS_SUCCESS => {
                // Either way the packet arrives through the port; see the
                // notification-mode note in `new`.
                self.requests.borrow_mut().insert(request.cookie, staged);
                Ok(SubmitOutcome::Pending)
            }
            other => Err(nt_status_to_io_error(other)),
        }
    }

    fn cancel(&self, cookie: Cookie) -> io::Result<()> {
        let nt = NtdllImports::get()?;
        let requests = self.requests.borrow();
        let Some(staged) = requests.get(&cookie) else {
            return Ok(());
        };
        let mut cancel_iosb: IO_STATUS_BLOCK = unsafe { mem::zeroed() };
        let status =
            unsafe { (nt.NtCancelIoFileEx)(self.afd, staged.iosb.get(), &mut cancel_iosb) };
        match status {
            STATUS_SUCCESS | STATUS_NOT_FOUND => Ok(()),
            other => Err(nt_status_to_io_error(other)),
        }
    }

    fn finish(&self, cookie: Cookie) {
        let Some(staged) = self.requests.borrow_mut().remove(&cookie) else {
            return;
        };
        let iosb = unsafe { &*staged.iosb.get() };
        staged.request.status.set(StatusBlock {
            status: unsafe { iosb.Anonymous.Status },
            information: iosb.Information,
        });

        let produced = staged.output.header().number_of_handles as usize;
        let mut output = staged.request.output.borrow_mut();
        let produced = produced.min(output.capacity());
        for (i, raw) in staged.output.entries()[..produced].iter().enumerate() {
            output.entries_mut()[i] = PollEntry {
                handle: raw.handle as u64,
                events: Readiness::from_bits_truncate(raw.events),
                status: raw.status,
            };
        }
        output.set_len(produced);
    }

    fn interpret(&self, raw: i32) -> CompletionStatus {
        match raw {
            STATUS_SUCCESS => CompletionStatus::Success,
            STATUS_CANCELLED => CompletionStatus::Aborted,
            other => CompletionStatus::Failed(nt_status_to_io_error(other)),
        }
    }
}

impl Drop for AfdDevice {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.afd);
        }
    }
}
