extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::RefCell;
use core::time::Duration;
use std::io::{self, ErrorKind};

use collections::bytes::{Cursor, Slice};
use log::error;
use stakker::Fwd;

mod rt;
pub mod logger;
pub mod proc;
pub mod sandbox;
pub mod time;

pub use rt::*;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{c_void as BufType, poll, pollfd as Poll, recv, send, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use u8 as BufType;
	pub use windows_sys::Win32::Networking::WinSock::{
		recv, send, WSAPoll as poll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT, SOCKET as RawFd, WSAPOLLFD as Poll,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

pub use sys::AsRawFd;
use sys::*;
use utils::error::*;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

pub(crate) fn ret_to_err(val: isize) -> Result<Option<usize>> {
	match TryInto::<usize>::try_into(val) {
		Ok(n) => Ok(Some(n)),
		Err(_) => {
			let err = io::Error::last_os_error();

			if matches!(err.kind(), ErrorKind::WouldBlock) {
				return Ok(None);
			}

			error!("I/O operation failed: {err}");
			Err(())
		}
	}
}

fn send(fd: RawFd, buf: &[u8]) -> Result<bool> {
	let r = unsafe { sys::send(fd, buf.as_ptr() as *mut BufType, buf.len() as _, 0) };

	if let Some(n) = ret_to_err(r as _)? {
		if n != buf.len() {
			error!("Only sent {}/{} bytes to socket", n, buf.len());
			return Err(());
		}

		Ok(true)
	} else {
		Ok(false)
	}
}

fn recv(fd: RawFd, buf: &mut Slice) -> Result<bool> {
	let r = unsafe { sys::recv(fd, buf.as_mut_ptr() as *mut BufType, buf.len() as _, 0) };

	if let Some(n) = ret_to_err(r as _)? {
		buf.truncate(n);
		Ok(true)
	} else {
		Ok(false)
	}
}

/// A tun device descriptor is a character device, not a socket: `send`/`recv`
/// return `ENOTSOCK` on it, so the ifn's device I/O goes through plain
/// `read`/`write` instead.
#[cfg(target_family = "unix")]
fn device_write(fd: RawFd, buf: &[u8]) -> Result<bool> {
	let r = unsafe { libc::write(fd, buf.as_ptr() as *const BufType, buf.len() as _) };

	if let Some(n) = ret_to_err(r as _)? {
		if n != buf.len() {
			error!("Only wrote {}/{} bytes to device", n, buf.len());
			return Err(());
		}

		Ok(true)
	} else {
		Ok(false)
	}
}

#[cfg(target_family = "unix")]
fn device_read(fd: RawFd, buf: &mut Slice) -> Result<bool> {
	let r = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut BufType, buf.len() as _) };

	if let Some(n) = ret_to_err(r as _)? {
		buf.truncate(n);
		Ok(true)
	} else {
		Ok(false)
	}
}

#[cfg(target_family = "unix")]
fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> std::net::SocketAddr {
	use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

	match i32::from(storage.ss_family) {
		libc::AF_INET => {
			// SAFETY: ss_family == AF_INET guarantees a sockaddr_in was written here.
			let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
			SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)), u16::from_be(sin.sin_port)))
		}
		_ => {
			// SAFETY: anything else we bind is AF_INET6.
			let sin6 = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
			SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(sin6.sin6_addr.s6_addr), u16::from_be(sin6.sin6_port), sin6.sin6_flowinfo, sin6.sin6_scope_id))
		}
	}
}

/// Reads one datagram off an unconnected socket, returning the sender's
/// address alongside it. Used for the proxy's listening sockets, which
/// unlike every other channel in this family of processes see datagrams
/// from many different remote peers rather than one connected counterpart.
#[cfg(target_family = "unix")]
fn recvfrom(fd: RawFd, buf: &mut Slice) -> Result<Option<std::net::SocketAddr>> {
	use std::mem::size_of;

	let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
	let mut addrlen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

	let r = unsafe {
		libc::recvfrom(
			fd,
			buf.as_mut_ptr().cast::<BufType>(),
			buf.len() as _,
			0,
			(&mut storage as *mut libc::sockaddr_storage).cast(),
			&mut addrlen,
		)
	};

	if let Some(n) = ret_to_err(r as _)? {
		buf.truncate(n);
		Ok(Some(sockaddr_to_std(&storage)))
	} else {
		Ok(None)
	}
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new(),
			reads: 0,
			writes: 0,
		})
	};
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
	reads: u64,
	writes: u64,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of<T: AsRawFd>(&mut self, socket: &T) -> usize {
		let raw = as_raw(socket);
		self.fds.iter().position(|f| f.fd == raw).expect("Socket is present")
	}

	/// Returns whether any more I/O is waiting.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Logs the lifetime read/write counters, invoked on exit and on `SIGUSR1`.
	fn log_stats(&self) {
		log::info!("poll stats: {} fds open, {} reads, {} writes", self.fds.len(), self.reads, self.writes);
	}

	/// Poll the fds. Returns whether any file descriptors are ready for I/O.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let mut pending: u32 = ret.try_into().map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(false);
		}

		for idx in 0.. {
			let Poll { fd, events, revents } = &mut self.fds[idx];
			let entry = &mut self.entries[idx];

			if *revents == 0 {
				continue;
			}

			if *revents & POLLERR != 0 {
				panic!("Socket error while polling");
			}

			if *revents & POLLHUP != 0 {
				panic!("Socket hangup");
			}

			if *revents & POLLNVAL != 0 {
				panic!("Socket invalid");
			}

			if *revents & POLLIN != 0 {
				self.reads += entry.flush_read(*fd)?;
			}

			if *revents & POLLOUT != 0 {
				self.writes += entry.flush_write(*fd)?;
			};

			*events = POLLIN;

			if !entry.queue.is_empty() {
				*events |= POLLOUT;
			}

			*revents = 0;

			pending -= 1;

			if pending == 0 {
				break;
			}
		}

		Ok(true)
	}
}

enum Kind {
	/// A connected socket: peer identity is implicit in the fd.
	Connected(Fwd<Slice>),
	/// An unconnected listening socket: every read may come from a
	/// different remote peer, so the address rides along with the bytes.
	Listening(Fwd<(Slice, std::net::SocketAddr)>),
	/// A connected socket that occasionally carries a passed file
	/// descriptor as `SCM_RIGHTS` ancillary data alongside the payload.
	#[cfg(target_family = "unix")]
	FdPass(Fwd<(Slice, Option<std::os::fd::OwnedFd>)>),
	/// A tun device fd: read/write, not send/recv.
	#[cfg(target_family = "unix")]
	Device(Fwd<Slice>),
}

struct Entry {
	kind: Kind,
	queue: VecDeque<Box<[u8]>>,
}

impl Entry {
	fn flush_read(&mut self, fd: RawFd) -> Result<u64> {
		let mut n = 0;

		match &mut self.kind {
			Kind::Connected(fwd) => {
				let mut buf = Slice::new(1500);

				while recv(fd, &mut buf)? {
					fwd.fwd(buf);
					buf = Slice::new(1500);
					n += 1;
				}
			}
			#[cfg(target_family = "unix")]
			Kind::Listening(fwd) => {
				let mut buf = Slice::new(1500);

				while let Some(from) = recvfrom(fd, &mut buf)? {
					fwd.fwd((buf, from));
					buf = Slice::new(1500);
					n += 1;
				}
			}
			#[cfg(not(target_family = "unix"))]
			Kind::Listening(_) => unreachable!("Listen is unix-only"),
			#[cfg(target_family = "unix")]
			Kind::FdPass(fwd) => {
				let mut raw = vec![0u8; 1500];

				while let Some((len, passed_fd)) = crate::proc::recv_fd(fd, &mut raw)? {
					let mut buf = Slice::new(len);
					buf.copy_from_slice(&raw[..len]);
					fwd.fwd((buf, passed_fd));
					n += 1;
				}
			}
			#[cfg(target_family = "unix")]
			Kind::Device(fwd) => {
				let mut buf = Slice::new(1500);

				while device_read(fd, &mut buf)? {
					fwd.fwd(buf);
					buf = Slice::new(1500);
					n += 1;
				}
			}
		}

		Ok(n)
	}

	fn flush_write(&mut self, fd: RawFd) -> Result<u64> {
		assert!(!self.queue.is_empty());
		let mut n = 0;

		loop {
			let Some(buf) = self.queue.back_mut() else { return Ok(n) };

			let wrote = match &self.kind {
				#[cfg(target_family = "unix")]
				Kind::Device(_) => device_write(fd, buf)?,
				_ => send(fd, buf)?,
			};

			if !wrote {
				return Ok(n);
			}

			self.queue.pop_back();
			n += 1;
		}
	}
}

pub struct Io<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> Io<T> {
	pub fn new(inner: T, fwd: Fwd<Slice>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			i.entries.push(Entry { kind: Kind::Connected(fwd), queue: VecDeque::new() });

			Self { inner }
		})
	}

	pub fn write<X>(&self, f: impl FnOnce(Cursor) -> X) -> Result<X> {
		let mut vec = vec![0; 1500];
		let res = Cursor::vec(&mut vec, f);

		if !send(as_raw(&self.inner), &mut vec)? {
			State::with(|i| {
				let idx = i.idx_of(&self.inner);
				i.entries[idx].queue.push_front(vec.into_boxed_slice());
				i.fds[idx].events |= POLLOUT;
			});
		}

		Ok(res)
	}
}

impl<T: AsRawFd> Drop for Io<T> {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}

/// The ifn's tun device: same shape as [`Io`], but reads and writes go
/// through `read`/`write` rather than `recv`/`send` since the fd names a
/// character device, not a socket.
#[cfg(target_family = "unix")]
pub struct TunIo<T: AsRawFd> {
	inner: T,
}

#[cfg(target_family = "unix")]
impl<T: AsRawFd> TunIo<T> {
	pub fn new(inner: T, fwd: Fwd<Slice>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			i.entries.push(Entry { kind: Kind::Device(fwd), queue: VecDeque::new() });

			Self { inner }
		})
	}

	pub fn write<X>(&self, f: impl FnOnce(Cursor) -> X) -> Result<X> {
		let mut vec = vec![0; 1500];
		let res = Cursor::vec(&mut vec, f);

		if !device_write(as_raw(&self.inner), &mut vec)? {
			State::with(|i| {
				let idx = i.idx_of(&self.inner);
				i.entries[idx].queue.push_front(vec.into_boxed_slice());
				i.fds[idx].events |= POLLOUT;
			});
		}

		Ok(res)
	}
}

#[cfg(target_family = "unix")]
impl<T: AsRawFd> Drop for TunIo<T> {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}

/// An unconnected listening socket. Unlike [`Io`] it never writes: the
/// proxy only ever reads a handshake/cookie datagram off one of these and
/// forwards it elsewhere, it never replies on the listening socket itself.
pub struct Listen<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> Listen<T> {
	pub fn new(inner: T, fwd: Fwd<(Slice, std::net::SocketAddr)>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			i.entries.push(Entry { kind: Kind::Listening(fwd), queue: VecDeque::new() });

			Self { inner }
		})
	}
}

impl<T: AsRawFd> Drop for Listen<T> {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}

/// A connected socket that can also pass a file descriptor as `SCM_RIGHTS`
/// ancillary data: the proxy's dedicated channel to each IFN, carrying
/// both ordinary forwarded messages and the occasional flow-socket handoff.
#[cfg(target_family = "unix")]
pub struct FdIo<T: AsRawFd> {
	inner: T,
}

#[cfg(target_family = "unix")]
impl<T: AsRawFd> FdIo<T> {
	pub fn new(inner: T, fwd: Fwd<(Slice, Option<std::os::fd::OwnedFd>)>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			i.entries.push(Entry { kind: Kind::FdPass(fwd), queue: VecDeque::new() });

			Self { inner }
		})
	}

	pub fn write<X>(&self, f: impl FnOnce(Cursor) -> X) -> Result<X> {
		let mut vec = vec![0; 1500];
		let res = Cursor::vec(&mut vec, f);

		if !send(as_raw(&self.inner), &mut vec)? {
			State::with(|i| {
				let idx = i.idx_of(&self.inner);
				i.entries[idx].queue.push_front(vec.into_boxed_slice());
				i.fds[idx].events |= POLLOUT;
			});
		}

		Ok(res)
	}

	/// Writes the bytes built by `f` together with `fd` as `SCM_RIGHTS`
	/// ancillary data. Unlike plain writes this is not queued on backpressure:
	/// flow-socket handoffs are rare enough that a dropped one is logged and
	/// simply retried by the next `MSGCONNREQ` for the same flow.
	pub fn write_fd<X>(&self, fd: RawFd, f: impl FnOnce(Cursor) -> X) -> Result<X> {
		let mut vec = vec![0; 1500];
		let res = Cursor::vec(&mut vec, f);

		proc::send_fd(as_raw(&self.inner), &vec, fd)?;

		Ok(res)
	}
}

#[cfg(target_family = "unix")]
impl<T: AsRawFd> Drop for FdIo<T> {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}
