#![allow(unsafe_code)]

//! Stream abstraction and readiness multiplexing.
//!
//! A [`ShellIo`] wraps a byte-oriented delegate (an OS pipe end or an
//! SSH channel half) and remembers every chunk that flows through it,
//! so the process layer can attach full stdin/stdout/stderr content to
//! an error long after the underlying descriptor is gone.
//!
//! [`select_io`] partitions a set of streams into ready and not-ready in
//! two phases: each stream's own readiness probe first (SSH channel
//! buffers are invisible to the kernel and must be polled proactively),
//! then a single blocking `poll(2)` over whatever descriptors the
//! streams expose. Only when the fast path finds nothing does the call
//! block.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::thread;
use std::time::Duration;

/// Capability interface satisfied by both stream backends.
///
/// `read` and `write` are non-blocking: they return
/// [`io::ErrorKind::WouldBlock`] instead of waiting, and `read` returns
/// `Ok(0)` at end of stream.
pub trait RawStream: Send {
    /// Reads available bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes as much of `buf` as the peer currently accepts.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Probes for readable data (or end of stream) without blocking.
    fn read_ready(&mut self) -> bool;

    /// Probes for writable buffer space without blocking.
    fn write_ready(&mut self) -> bool;

    /// Descriptor usable in a `poll(2)` wait, when the backend has one.
    fn poll_fd(&self) -> Option<RawFd>;

    /// Releases the underlying resource.
    fn close(&mut self) -> io::Result<()>;
}

/// A stream handle that accumulates everything read or written.
pub struct ShellIo {
    name: &'static str,
    delegate: Box<dyn RawStream>,
    captured: Vec<u8>,
    closed: bool,
}

impl fmt::Debug for ShellIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellIo")
            .field("name", &self.name)
            .field("captured", &self.captured.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ShellIo {
    /// Wraps a delegate under a diagnostic name (`stdin`, `stdout`, ...).
    #[must_use]
    pub fn new(name: &'static str, delegate: Box<dyn RawStream>) -> Self {
        Self {
            name,
            delegate,
            captured: Vec::new(),
            closed: false,
        }
    }

    /// Returns the diagnostic name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Reads a chunk, remembering it. `Ok(0)` signals end of stream; a
    /// closed handle always reads as end of stream.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let read = self.delegate.read(buf)?;
        self.captured.extend_from_slice(&buf[..read]);
        Ok(read)
    }

    /// Writes a chunk, remembering the accepted prefix. `Ok(0)` with a
    /// non-empty `data` means the peer no longer accepts input.
    pub fn write_chunk(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        let written = self.delegate.write(data)?;
        self.captured.extend_from_slice(&data[..written]);
        Ok(written)
    }

    /// Non-blocking readable probe; closed handles are never ready.
    pub fn read_ready(&mut self) -> bool {
        !self.closed && self.delegate.read_ready()
    }

    /// Non-blocking writable probe; closed handles are never ready.
    pub fn write_ready(&mut self) -> bool {
        !self.closed && self.delegate.write_ready()
    }

    /// Descriptor for the blocking wait phase, if still open.
    #[must_use]
    pub fn poll_fd(&self) -> Option<RawFd> {
        if self.closed {
            None
        } else {
            self.delegate.poll_fd()
        }
    }

    /// Closes the stream. Idempotent; captured content survives.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.delegate.close()
    }

    /// Returns `true` once the stream has been closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Every byte that has flowed through this stream, in order.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.captured
    }

    /// Captured content as (lossily decoded) text.
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.captured)
    }
}

/// Direction a stream participates in during a [`select_io`] round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoInterest {
    /// Wait for readable data (or end of stream).
    Read,
    /// Wait for writable buffer space.
    Write,
}

/// Partitions `entries` into ready and not-ready within `timeout`.
///
/// Returns one readiness flag per entry, in order. Phase one probes each
/// open stream directly and returns immediately when anything is already
/// ready (or when `timeout` is zero). Phase two blocks in a single
/// `poll(2)` across the streams' descriptors, then re-probes; streams
/// without a descriptor are covered by re-probing after the wait. With
/// no pollable descriptor at all the call degrades to a plain sleep.
pub fn select_io(
    entries: &mut [(IoInterest, &mut ShellIo)],
    timeout: Duration,
) -> io::Result<Vec<bool>> {
    let mut ready = vec![false; entries.len()];
    let mut any_ready = false;
    for (index, (interest, stream)) in entries.iter_mut().enumerate() {
        let is_ready = match interest {
            IoInterest::Read => stream.read_ready(),
            IoInterest::Write => stream.write_ready(),
        };
        if is_ready {
            ready[index] = true;
            any_ready = true;
        }
    }
    if any_ready || timeout.is_zero() {
        return Ok(ready);
    }

    let mut pollfds = Vec::with_capacity(entries.len());
    for (interest, stream) in entries.iter() {
        if let Some(fd) = stream.poll_fd() {
            let events = match interest {
                IoInterest::Read => libc::POLLIN,
                IoInterest::Write => libc::POLLOUT,
            };
            pollfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }
    }
    if pollfds.is_empty() {
        thread::sleep(timeout);
    } else {
        poll_fds(&mut pollfds, timeout)?;
    }

    for (index, (interest, stream)) in entries.iter_mut().enumerate() {
        ready[index] = match interest {
            IoInterest::Read => stream.read_ready(),
            IoInterest::Write => stream.write_ready(),
        };
    }
    Ok(ready)
}

/// Blocking `poll(2)` wrapper restarted on `EINTR`.
pub(crate) fn poll_fds(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

/// Non-blocking single-descriptor readiness probe.
///
/// Hangup and error conditions count as ready so the subsequent read can
/// observe end of stream instead of the wait spinning forever.
pub(crate) fn poll_single(fd: RawFd, events: libc::c_short) -> bool {
    let mut fds = [libc::pollfd {
        fd,
        events,
        revents: 0,
    }];
    match poll_fds(&mut fds, Duration::ZERO) {
        Ok(count) => {
            count > 0 && fds[0].revents & (events | libc::POLLHUP | libc::POLLERR) != 0
        }
        Err(_) => false,
    }
}
