//! Thin wrapper over Linux `epoll`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Readiness a registration is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    pub const READ_WRITE: Interest = Interest {
        readable: true,
        writable: true,
    };

    fn to_epoll(self) -> u32 {
        let mut bits = 0;
        if self.readable {
            bits |= libc::EPOLLIN as u32;
        }
        if self.writable {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// The descriptor hung up or reported an error condition.
    pub hangup: bool,
}

impl Event {
    fn from_epoll(raw: &libc::epoll_event) -> Self {
        let bits = raw.events;
        Self {
            fd: raw.u64 as RawFd,
            readable: bits & libc::EPOLLIN as u32 != 0,
            writable: bits & libc::EPOLLOUT as u32 != 0,
            hangup: bits & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0,
        }
    }
}

/// An epoll instance. Registrations are keyed by the descriptor itself.
#[derive(Debug)]
pub struct Poller {
    epfd: OwnedFd,
    buf: Vec<libc::epoll_event>,
}

impl Poller {
    /// Create a poller that reports at most `max_events` events per wait.
    pub fn new(max_events: usize) -> io::Result<Self> {
        // SAFETY: epoll_create1 has no memory-safety preconditions.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created descriptor owned by nobody else.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            epfd,
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    /// Remove `fd`. Must happen before the descriptor is closed.
    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: a null event pointer is accepted for EPOLL_CTL_DEL.
        let rc = unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.to_epoll(),
            u64: fd as u64,
        };
        // SAFETY: event points to a valid epoll_event for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for readiness, replacing the contents of `events`.
    ///
    /// `None` waits indefinitely. An interrupted wait returns no events.
    pub fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        events.clear();
        let timeout_ms = timeout.map_or(-1, timeout_to_ms);
        let capacity = libc::c_int::try_from(self.buf.len()).unwrap_or(libc::c_int::MAX);

        // SAFETY: buf holds `capacity` initialized epoll_event slots.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.buf.as_mut_ptr(),
                capacity,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let n = n as usize;
        events.extend(self.buf[..n].iter().map(Event::from_epoll));
        Ok(n)
    }
}

/// Milliseconds for epoll_wait, rounded up so a pending deadline is never
/// reported as "now" too early.
fn timeout_to_ms(timeout: Duration) -> libc::c_int {
    let partial = timeout.subsec_nanos() % 1_000_000 != 0;
    let ms = timeout.as_millis() + u128::from(partial);
    libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
}
