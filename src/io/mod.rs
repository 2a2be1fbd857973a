//! Asynchronous IO primitives backed by the ring.
//!
//! Every function submits one operation and resolves with its result. The
//! kernel writes into buffers owned by the operation's record, so buffers
//! are passed by value and handed back on completion. All futures here may
//! be raced with [`timeout`](crate::time::timeout) or given a kernel-side
//! deadline with [`Op::deadline`].

use std::ffi::CString;
use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;

use io_uring::types::Fd;
use io_uring::{opcode, squeue, types};

pub use crate::driver::Op;
#[doc(hidden)]
pub use crate::driver::Payload;
pub use crate::driver::DriverError;

/// No-op submission; completes once it round-trips through the kernel.
pub fn nop() -> Op<Nop> {
    Op::new(Nop)
}

pub struct Nop;

impl Payload for Nop {
    type Output = ();

    fn entry(&mut self) -> squeue::Entry {
        opcode::Nop::new().build()
    }

    fn output(self, _res: i32) -> io::Result<()> {
        Ok(())
    }
}

/// Reads at the file's current position into `buf`, returning the filled
/// prefix length and the buffer.
pub fn read(fd: RawFd, buf: Vec<u8>) -> Op<Read> {
    read_at(fd, buf, u64::MAX)
}

/// Reads at `offset`. An offset of `u64::MAX` uses the current position.
pub fn read_at(fd: RawFd, buf: Vec<u8>, offset: u64) -> Op<Read> {
    Op::new(Read { fd, buf, offset })
}

pub struct Read {
    fd: RawFd,
    buf: Vec<u8>,
    offset: u64,
}

impl Payload for Read {
    type Output = (usize, Vec<u8>);

    fn entry(&mut self) -> squeue::Entry {
        opcode::Read::new(Fd(self.fd), self.buf.as_mut_ptr(), self.buf.capacity() as u32)
            .offset(self.offset)
            .build()
    }

    fn output(mut self, res: i32) -> io::Result<Self::Output> {
        let n = res as usize;
        // Safety: the kernel wrote `n` bytes into the spare capacity.
        unsafe { self.buf.set_len(n) };
        Ok((n, self.buf))
    }
}

/// Writes `buf` at the file's current position, returning the number of
/// bytes accepted and the buffer.
pub fn write(fd: RawFd, buf: Vec<u8>) -> Op<Write> {
    write_at(fd, buf, u64::MAX)
}

pub fn write_at(fd: RawFd, buf: Vec<u8>, offset: u64) -> Op<Write> {
    Op::new(Write { fd, buf, offset })
}

pub struct Write {
    fd: RawFd,
    buf: Vec<u8>,
    offset: u64,
}

impl Payload for Write {
    type Output = (usize, Vec<u8>);

    fn entry(&mut self) -> squeue::Entry {
        opcode::Write::new(Fd(self.fd), self.buf.as_ptr(), self.buf.len() as u32)
            .offset(self.offset)
            .build()
    }

    fn output(self, res: i32) -> io::Result<Self::Output> {
        Ok((res as usize, self.buf))
    }
}

/// Scatter read into several buffers, filling them in order.
pub fn readv(fd: RawFd, bufs: Vec<Vec<u8>>) -> Op<Readv> {
    Op::new(Readv {
        fd,
        bufs,
        iovecs: Vec::new(),
    })
}

pub struct Readv {
    fd: RawFd,
    bufs: Vec<Vec<u8>>,
    /// Built in `entry`; must live in the record for the whole flight.
    iovecs: Vec<libc::iovec>,
}

// Safety: the iovec pointers only reference the buffers in `bufs`, owned by
// the same record; nothing aliases them across threads.
unsafe impl std::marker::Send for Readv {}

impl Payload for Readv {
    type Output = (usize, Vec<Vec<u8>>);

    fn entry(&mut self) -> squeue::Entry {
        self.iovecs = self
            .bufs
            .iter_mut()
            .map(|b| libc::iovec {
                iov_base: b.as_mut_ptr() as *mut libc::c_void,
                iov_len: b.capacity(),
            })
            .collect();
        opcode::Readv::new(Fd(self.fd), self.iovecs.as_ptr(), self.iovecs.len() as u32).build()
    }

    fn output(mut self, res: i32) -> io::Result<Self::Output> {
        let mut remaining = res as usize;
        for buf in &mut self.bufs {
            let filled = remaining.min(buf.capacity());
            unsafe { buf.set_len(filled) };
            remaining -= filled;
        }
        Ok((res as usize, self.bufs))
    }
}

/// Gather write from several buffers.
pub fn writev(fd: RawFd, bufs: Vec<Vec<u8>>) -> Op<Writev> {
    Op::new(Writev {
        fd,
        bufs,
        iovecs: Vec::new(),
    })
}

pub struct Writev {
    fd: RawFd,
    bufs: Vec<Vec<u8>>,
    iovecs: Vec<libc::iovec>,
}

// Safety: as for `Readv`, the iovecs point into `bufs` only.
unsafe impl std::marker::Send for Writev {}

impl Payload for Writev {
    type Output = (usize, Vec<Vec<u8>>);

    fn entry(&mut self) -> squeue::Entry {
        self.iovecs = self
            .bufs
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.as_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();
        opcode::Writev::new(Fd(self.fd), self.iovecs.as_ptr(), self.iovecs.len() as u32).build()
    }

    fn output(self, res: i32) -> io::Result<Self::Output> {
        Ok((res as usize, self.bufs))
    }
}

/// Sends on a connected socket.
pub fn send(fd: RawFd, buf: Vec<u8>) -> Op<Send> {
    Op::new(Send { fd, buf })
}

pub struct Send {
    fd: RawFd,
    buf: Vec<u8>,
}

impl Payload for Send {
    type Output = (usize, Vec<u8>);

    fn entry(&mut self) -> squeue::Entry {
        opcode::Send::new(Fd(self.fd), self.buf.as_ptr(), self.buf.len() as u32).build()
    }

    fn output(self, res: i32) -> io::Result<Self::Output> {
        Ok((res as usize, self.buf))
    }
}

/// Receives from a connected socket.
pub fn recv(fd: RawFd, buf: Vec<u8>) -> Op<Recv> {
    Op::new(Recv { fd, buf })
}

pub struct Recv {
    fd: RawFd,
    buf: Vec<u8>,
}

impl Payload for Recv {
    type Output = (usize, Vec<u8>);

    fn entry(&mut self) -> squeue::Entry {
        opcode::Recv::new(Fd(self.fd), self.buf.as_mut_ptr(), self.buf.capacity() as u32).build()
    }

    fn output(mut self, res: i32) -> io::Result<Self::Output> {
        let n = res as usize;
        unsafe { self.buf.set_len(n) };
        Ok((n, self.buf))
    }
}

/// Accepts one connection on a listening socket.
pub fn accept(fd: RawFd) -> Op<Accept> {
    Op::new(Accept {
        fd,
        addr: MaybeUninit::zeroed(),
        addr_len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
    })
}

pub struct Accept {
    fd: RawFd,
    addr: MaybeUninit<libc::sockaddr_storage>,
    addr_len: libc::socklen_t,
}

impl Payload for Accept {
    type Output = (OwnedFd, SocketAddr);

    fn entry(&mut self) -> squeue::Entry {
        opcode::Accept::new(
            Fd(self.fd),
            self.addr.as_mut_ptr() as *mut libc::sockaddr,
            &mut self.addr_len,
        )
        .flags(libc::SOCK_CLOEXEC)
        .build()
    }

    fn output(self, res: i32) -> io::Result<Self::Output> {
        let fd = unsafe { OwnedFd::from_raw_fd(res) };
        let addr = unsafe { parse_sockaddr(self.addr.as_ptr()) }?;
        Ok((fd, addr))
    }
}

/// Connects a socket to `addr`.
pub fn connect(fd: RawFd, addr: SocketAddr) -> Op<Connect> {
    let (storage, len) = sockaddr_storage(&addr);
    Op::new(Connect {
        fd,
        storage,
        len,
    })
}

pub struct Connect {
    fd: RawFd,
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl Payload for Connect {
    type Output = ();

    fn entry(&mut self) -> squeue::Entry {
        opcode::Connect::new(
            Fd(self.fd),
            &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            self.len,
        )
        .build()
    }

    fn output(self, _res: i32) -> io::Result<()> {
        Ok(())
    }
}

/// Opens `path` relative to the current directory.
pub fn open<P: AsRef<Path>>(path: P, flags: i32, mode: u32) -> io::Result<Op<OpenAt>> {
    openat(libc::AT_FDCWD, path, flags, mode)
}

/// Opens `path` relative to `dirfd`.
pub fn openat<P: AsRef<Path>>(
    dirfd: RawFd,
    path: P,
    flags: i32,
    mode: u32,
) -> io::Result<Op<OpenAt>> {
    let path = cstring_path(path.as_ref())?;
    Ok(Op::new(OpenAt {
        dirfd,
        path,
        flags,
        mode,
    }))
}

pub struct OpenAt {
    dirfd: RawFd,
    path: CString,
    flags: i32,
    mode: u32,
}

impl Payload for OpenAt {
    type Output = OwnedFd;

    fn entry(&mut self) -> squeue::Entry {
        opcode::OpenAt::new(Fd(self.dirfd), self.path.as_ptr())
            .flags(self.flags | libc::O_CLOEXEC)
            .mode(self.mode)
            .build()
    }

    fn output(self, res: i32) -> io::Result<OwnedFd> {
        Ok(unsafe { OwnedFd::from_raw_fd(res) })
    }
}

/// Closes a descriptor through the ring. The descriptor is consumed either
/// way; on failure the kernel has still released it.
pub fn close(fd: OwnedFd) -> Op<Close> {
    Op::new(Close {
        fd: fd.into_raw_fd(),
    })
}

pub struct Close {
    fd: RawFd,
}

impl Payload for Close {
    type Output = ();

    fn entry(&mut self) -> squeue::Entry {
        opcode::Close::new(Fd(self.fd)).build()
    }

    fn output(self, _res: i32) -> io::Result<()> {
        Ok(())
    }
}

/// Flushes file data and metadata to storage.
pub fn fsync(fd: RawFd) -> Op<Fsync> {
    Op::new(Fsync { fd })
}

pub struct Fsync {
    fd: RawFd,
}

impl Payload for Fsync {
    type Output = ();

    fn entry(&mut self) -> squeue::Entry {
        opcode::Fsync::new(Fd(self.fd)).build()
    }

    fn output(self, _res: i32) -> io::Result<()> {
        Ok(())
    }
}

/// Queries file metadata for `path`.
pub fn statx<P: AsRef<Path>>(path: P) -> io::Result<Op<Statx>> {
    let path = cstring_path(path.as_ref())?;
    Ok(Op::new(Statx {
        path,
        buf: Box::new(unsafe { mem::zeroed() }),
    }))
}

pub struct Statx {
    path: CString,
    /// Boxed so the kernel-visible address survives record moves before
    /// submission.
    buf: Box<libc::statx>,
}

impl Payload for Statx {
    type Output = libc::statx;

    fn entry(&mut self) -> squeue::Entry {
        opcode::Statx::new(
            Fd(libc::AT_FDCWD),
            self.path.as_ptr(),
            &mut *self.buf as *mut libc::statx as *mut _,
        )
        .mask(libc::STATX_BASIC_STATS)
        .build()
    }

    fn output(self, _res: i32) -> io::Result<libc::statx> {
        Ok(*self.buf)
    }
}

/// Requests cancellation of every in-flight operation on `fd`, resolving to
/// the number of operations actually cancelled.
pub fn cancel_fd(fd: RawFd) -> Op<CancelFd> {
    Op::new(CancelFd { fd })
}

pub struct CancelFd {
    fd: RawFd,
}

impl Payload for CancelFd {
    type Output = usize;

    fn entry(&mut self) -> squeue::Entry {
        opcode::AsyncCancel2::new(types::CancelBuilder::fd(Fd(self.fd)).all()).build()
    }

    fn output(self, res: i32) -> io::Result<usize> {
        Ok(res as usize)
    }
}

fn cstring_path(path: &Path) -> io::Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a nul byte"))
}

fn sockaddr_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Safety: `storage` must point at a kernel-filled sockaddr.
unsafe fn parse_sockaddr(storage: *const libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = &*(storage as *const libc::sockaddr_in);
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = &*(storage as *const libc::sockaddr_in6);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {family}"),
        )),
    }
}
