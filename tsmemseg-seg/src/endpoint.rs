//! Named segment endpoints.
//!
//! Each ring slot is exposed as a POSIX FIFO under `/tmp` named
//! `tsmemseg_<name><NN>.fifo`. The writer side is opened nonblocking, so
//! an open succeeds exactly when a reader is waiting; delivery then pushes
//! the slot's buffer through the pipe with `poll`-paced nonblocking
//! writes.
//!
//! The trait keeps the platform seam: a named-pipe backend can slot in on
//! other systems without touching the delivery loop.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// A named endpoint a reader can attach to.
pub trait SegmentEndpoint: Send {
    /// Try to accept a reader without blocking. Returns a writer handle
    /// when one is attached.
    fn accept_reader(&mut self) -> io::Result<Option<Box<dyn EndpointWriter>>>;

    /// Remove the endpoint from the system.
    fn destroy(&mut self);
}

/// An attached reader being served.
pub trait EndpointWriter: Send {
    /// Raw descriptor for multiplexed polling.
    fn raw_fd(&self) -> i32;

    /// Write as much of `data` as the pipe accepts right now.
    ///
    /// `Ok(0)` means the pipe is full (try again after `POLLOUT`); an
    /// error of kind `BrokenPipe` means the reader went away.
    fn write_some(&mut self, data: &[u8]) -> io::Result<usize>;
}

/// Derive the endpoint path for a slot index.
pub fn endpoint_path(name: &str, index: usize) -> PathBuf {
    PathBuf::from(format!("/tmp/tsmemseg_{name}{index:02}.fifo"))
}

/// POSIX FIFO endpoint.
pub struct FifoEndpoint {
    path: PathBuf,
    created: bool,
}

impl FifoEndpoint {
    /// Create the FIFO with mode 0700. Fails if the path cannot be
    /// created (an existing FIFO from a crashed run is removed first).
    pub fn create(path: PathBuf) -> io::Result<Self> {
        let c_path = c_path(&path)?;
        unsafe {
            libc::unlink(c_path.as_ptr());
            if libc::mkfifo(c_path.as_ptr(), 0o700) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Self {
            path,
            created: true,
        })
    }
}

impl SegmentEndpoint for FifoEndpoint {
    fn accept_reader(&mut self) -> io::Result<Option<Box<dyn EndpointWriter>>> {
        let c_path = c_path(&self.path)?;
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_WRONLY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            // ENXIO: no reader has the FIFO open yet.
            if err.raw_os_error() == Some(libc::ENXIO) {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(Box::new(FifoWriter { fd })))
    }

    fn destroy(&mut self) {
        if self.created {
            if let Ok(c_path) = c_path(&self.path) {
                unsafe {
                    libc::unlink(c_path.as_ptr());
                }
            }
            self.created = false;
        }
    }
}

/// Writer side of an accepted FIFO reader.
struct FifoWriter {
    fd: i32,
}

impl EndpointWriter for FifoWriter {
    fn raw_fd(&self) -> i32 {
        self.fd
    }

    fn write_some(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, data.as_ptr().cast(), data.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(0),
            Some(libc::EINTR) => Ok(0),
            _ => Err(err),
        }
    }
}

impl Drop for FifoWriter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;

    #[test]
    fn test_endpoint_path_format() {
        assert_eq!(
            endpoint_path("live", 0),
            PathBuf::from("/tmp/tsmemseg_live00.fifo")
        );
        assert_eq!(
            endpoint_path("live", 12),
            PathBuf::from("/tmp/tsmemseg_live12.fifo")
        );
    }

    #[test]
    fn test_create_accept_write_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg00.fifo");
        let mut endpoint = FifoEndpoint::create(path.clone()).unwrap();

        // No reader yet.
        assert!(endpoint.accept_reader().unwrap().is_none());

        // Attach a reader in another thread, then the accept succeeds.
        let reader_path = path.clone();
        let reader = std::thread::spawn(move || {
            let mut data = Vec::new();
            File::open(reader_path).unwrap().read_to_end(&mut data).unwrap();
            data
        });

        let mut writer = loop {
            if let Some(writer) = endpoint.accept_reader().unwrap() {
                break writer;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };

        let payload = b"segment bytes";
        let mut written = 0;
        while written < payload.len() {
            written += writer.write_some(&payload[written..]).unwrap();
        }
        drop(writer);

        assert_eq!(reader.join().unwrap(), payload);

        endpoint.destroy();
        assert!(!path.exists());
    }
}
