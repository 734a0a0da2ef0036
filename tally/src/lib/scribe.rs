use std::ffi::CString;
use std::fmt::{self, Write as _};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use libc::{c_int, O_APPEND, O_CREAT, O_TRUNC, O_WRONLY};

/// Upper bound of one diagnostic line, prefix included. Longer messages are
/// truncated rather than split across writes.
const LINE_CAP: usize = 8192;

/// Append-only diagnostic channel.
///
/// Every line reads `[<thread-id>] [<unix-time>] <message>` and is emitted
/// with a single `write(2)` per sink. Construction may allocate (it opens
/// files); [`Scribe::say`] never does, so it is safe to call from the middle
/// of an interposed allocation.
pub struct Scribe {
    console: bool,
    file: Option<c_int>,
}

impl Scribe {
    /// Echo to stdout only. Used by the arena strategy, which has no
    /// diagnostic directory of its own.
    pub fn console() -> Scribe {
        Scribe { console: true, file: None }
    }

    /// Echo to stdout and append to `path`, truncating any previous log.
    pub fn tee(path: &Path) -> io::Result<Scribe> {
        Ok(Scribe { console: true, file: Some(open_log(path)?) })
    }

    /// Append to `path` only. Keeps test output readable.
    pub fn file_only(path: &Path) -> io::Result<Scribe> {
        Ok(Scribe { console: false, file: Some(open_log(path)?) })
    }

    /// Swallow everything.
    pub fn muted() -> Scribe {
        Scribe { console: false, file: None }
    }

    /// Emit one line. Allocation-free; formatting happens in a stack buffer
    /// and anything past [`LINE_CAP`] is dropped.
    pub fn say(&self, message: fmt::Arguments<'_>) {
        let mut line = StackLine::new();
        let tid = unsafe { libc::pthread_self() };
        let now = unsafe { libc::time(std::ptr::null_mut()) };
        let _ = write!(line, "[{}] [{}] ", tid, now);
        let _ = line.write_fmt(message);
        line.terminate();

        if self.console {
            unsafe {
                libc::write(1, line.bytes().as_ptr().cast(), line.bytes().len());
            }
        }
        if let Some(fd) = self.file {
            unsafe {
                libc::write(fd, line.bytes().as_ptr().cast(), line.bytes().len());
            }
        }
    }
}

impl Drop for Scribe {
    fn drop(&mut self) {
        if let Some(fd) = self.file {
            unsafe { libc::close(fd) };
        }
    }
}

fn open_log(path: &Path) -> io::Result<c_int> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), O_WRONLY | O_CREAT | O_APPEND | O_TRUNC, 0o644) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// `fmt::Write` over a fixed buffer. Overflow truncates silently.
struct StackLine {
    buf: [u8; LINE_CAP],
    len: usize,
}

impl StackLine {
    fn new() -> StackLine {
        StackLine { buf: [0; LINE_CAP], len: 0 }
    }

    fn terminate(&mut self) {
        // Reserve one byte so the newline always fits.
        if self.len == LINE_CAP {
            self.len -= 1;
        }
        self.buf[self.len] = b'\n';
        self.len += 1;
    }

    fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for StackLine {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAP.saturating_sub(self.len + 1);
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}
