//! File descriptor primitives
//!
//! OS pipes and descriptor duplication. Every descriptor created here is
//! close-on-exec; a child only receives what its spawn request maps
//! explicitly.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::FileTypeExt;

/// A connected read/write descriptor pair.
///
/// Each end is an `OwnedFd`, so it is closed exactly once by whichever
/// scope ends up holding it.
#[derive(Debug)]
pub struct Pipe {
    pub read_end: OwnedFd,
    pub write_end: OwnedFd,
}

impl Pipe {
    /// Open a new OS pipe.
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = io::pipe()?;
        Ok(Self {
            read_end: reader.into(),
            write_end: writer.into(),
        })
    }

    /// Read end of a pipe whose write end is already closed.
    ///
    /// Reads hit end-of-file immediately, which makes this a readiness
    /// compatible stand-in for reading `/dev/null`.
    pub fn half_closed_reader() -> io::Result<OwnedFd> {
        let Pipe {
            read_end,
            write_end,
        } = Self::new()?;
        drop(write_end);
        Ok(read_end)
    }

    /// Split into `(read_end, write_end)`.
    pub fn into_parts(self) -> (OwnedFd, OwnedFd) {
        (self.read_end, self.write_end)
    }
}

/// Duplicate a descriptor into a new owned, close-on-exec descriptor.
///
/// The original stays untouched; callers release it only after the copy
/// exists, so a failure never leaves zero valid copies.
pub fn duplicate(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    fd.try_clone_to_owned()
}

/// Borrow a raw descriptor.
///
/// # Safety
/// `fd` must stay open for the whole lifetime `'a`.
pub unsafe fn borrow_raw<'a>(fd: RawFd) -> BorrowedFd<'a> {
    BorrowedFd::borrow_raw(fd)
}

/// Kind of object behind a descriptor, as far as the I/O engine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// A pipe or FIFO; can be driven by the readiness reactor.
    Fifo,
    /// Anything else (regular file, terminal, character device).
    Other,
}

/// Classify an owned descriptor, handing ownership back.
pub fn classify(fd: OwnedFd) -> io::Result<(OwnedFd, DescriptorKind)> {
    let file = File::from(fd);
    let kind = if file.metadata()?.file_type().is_fifo() {
        DescriptorKind::Fifo
    } else {
        DescriptorKind::Other
    };
    Ok((OwnedFd::from(file), kind))
}

/// Lowest descriptor number `>= 0` not contained in `taken`.
pub fn lowest_unused(taken: impl IntoIterator<Item = RawFd>) -> RawFd {
    let mut taken: Vec<RawFd> = taken.into_iter().filter(|fd| *fd >= 0).collect();
    taken.sort_unstable();
    taken.dedup();
    let mut candidate = 0;
    for fd in taken {
        if fd != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

/// Whether `fd` currently refers to an open descriptor in this process.
pub fn is_open(fd: impl AsFd) -> bool {
    use std::os::fd::AsRawFd;
    let raw = fd.as_fd().as_raw_fd();
    // SAFETY: F_GETFD has no side effects.
    unsafe { nix::libc::fcntl(raw, nix::libc::F_GETFD) != -1 }
}
