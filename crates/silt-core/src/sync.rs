//! Platform durable-sync primitive
//!
//! A successful return means the file's data has reached persistent storage
//! and will survive power loss. Each platform needs a different call to get
//! that guarantee; plain `fsync` is not it everywhere (macOS in particular
//! only flushes to the drive's volatile cache).

use std::fs::File;
use std::io;

/// Force the file's data to persistent storage.
///
/// - Linux: `fdatasync()` — data without metadata, sufficient for appends
/// - macOS/iOS: `fcntl(F_FULLFSYNC)` — the only durable option on Apple disks
/// - Windows: `FlushFileBuffers()`
/// - elsewhere: `File::sync_data()`
///
/// May block for milliseconds on spinning media; callers hold the engine
/// state lock across it, which is intended — ordering matters more than
/// latency here.
pub fn sync_file(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File borrow, so it is open.
        let rc = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File borrow, so it is open.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live File borrow, so it is open.
        let rc = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if rc != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows"
    )))]
    {
        file.sync_data()
    }
}
