//! I/O completion port wrapper.

use std::cell::Cell;
use std::io;
use std::ptr;
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, GetQueuedCompletionStatusEx,
    OVERLAPPED, OVERLAPPED_ENTRY,
};
use windows_sys::Win32::System::WindowsProgramming::INFINITE;

use crate::queue::{CompletionQueue, CompletionRecord};

/// A completion queue backed by an I/O completion port.
pub struct IocpQueue {
    port: HANDLE,
    next_tag: Cell<u64>,
}

impl IocpQueue {
    pub fn new() -> io::Result<IocpQueue> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 0) };
        if port == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(IocpQueue {
            port,
            next_tag: Cell::new(1),
        })
    }

    pub(crate) fn raw(&self) -> HANDLE {
        self.port
    }

    /// Allocate a completion-key tag for a device bound to this port.
    pub(crate) fn allocate_tag(&self) -> u64 {
        let tag = self.next_tag.get();
        self.next_tag.set(tag + 1);
        tag
    }
}

fn to_millis(timeout: Option<Duration>) -> u32 {
    match timeout {
        None => INFINITE,
        Some(t) => t.as_millis().min(u128::from(INFINITE - 1)) as u32,
    }
}

impl CompletionQueue for IocpQueue {
    fn wait(&self, timeout: Option<Duration>) -> io::Result<Option<CompletionRecord>> {
        let mut bytes: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();

        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.port,
                &mut bytes,
                &mut key,
                &mut overlapped,
                to_millis(timeout),
            )
        };
        if ok == 0 {
            // A failed wait with a packet attached is a completion whose
            // operation failed (an aborted poll, for instance); the
            // driver reads the status from its own record.
            if overlapped.is_null() {
                let err = unsafe { GetLastError() };
                if err == WAIT_TIMEOUT {
                    return Ok(None);
                }
                return Err(io::Error::from_raw_os_error(err as i32));
            }
        }
        Ok(Some(CompletionRecord {
            bytes,
            tag: key as u64,
            cookie: overlapped as u64,
        }))
    }

    fn wait_batch(
        &self,
        max: usize,
        timeout: Option<Duration>,
    ) -> io::Result<Vec<CompletionRecord>> {
        let mut entries: Vec<OVERLAPPED_ENTRY> = vec![unsafe { std::mem::zeroed() }; max.max(1)];
        let mut removed: u32 = 0;

        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                entries.len() as u32,
                &mut removed,
                to_millis(timeout),
                0,
            )
        };
        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err == WAIT_TIMEOUT {
                return Ok(Vec::new());
            }
            return Err(io::Error::from_raw_os_error(err as i32));
        }
        Ok(entries[..removed as usize]
            .iter()
            .map(|e| CompletionRecord {
                bytes: e.dwNumberOfBytesTransferred,
                tag: e.lpCompletionKey as u64,
                cookie: e.lpOverlapped as u64,
            })
            .collect())
    }
}

impl Drop for IocpQueue {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.port);
        }
    }
}
