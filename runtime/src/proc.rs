//! Process bootstrap helpers used by the master to split itself into the
//! enclave/proxy/ifn children: a `socketpair` per child plus a `fork` +
//! re-exec so the child starts from a clean image with only its own
//! datagram channel inherited.

use std::ffi::CString;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use log::error;
use utils::error::Result;

use crate::ret_to_err;

/// A connected pair of `SOCK_DGRAM` descriptors for master/child IPC.
pub struct Socketpair {
	pub parent: OwnedFd,
	pub child: OwnedFd,
}

/// Creates a `socketpair(2)` of `AF_UNIX`/`SOCK_DGRAM` descriptors.
pub fn socketpair() -> Result<Socketpair> {
	let mut fds = [0 as RawFd; 2];

	let r = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };

	if r != 0 {
		error!("socketpair() failed: {}", std::io::Error::last_os_error());
		return Err(());
	}

	// SAFETY: socketpair() populated both descriptors on success.
	Ok(unsafe { Socketpair { parent: OwnedFd::from_raw_fd(fds[0]), child: OwnedFd::from_raw_fd(fds[1]) } })
}

pub enum Forked {
	Parent { pid: libc::pid_t },
	Child,
}

/// Forks the process. The caller is responsible for closing descriptors
/// that shouldn't cross the fork before calling, and for re-exec'ing in
/// the `Child` branch before returning to safe code.
///
/// # Safety
/// Only async-signal-safe operations are permitted between the fork and
/// the eventual `execve` in the child branch.
pub unsafe fn fork() -> Result<Forked> {
	match libc::fork() {
		-1 => {
			error!("fork() failed: {}", std::io::Error::last_os_error());
			Err(())
		}
		0 => Ok(Forked::Child),
		pid => Ok(Forked::Parent { pid }),
	}
}

/// Re-execs the current binary at `path`, passing `args` verbatim and
/// leaving the environment untouched. Does not return on success.
pub fn reexec(path: &str, args: &[String]) -> Result<()> {
	let c_path = CString::new(path).map_err(|_| error!("exec path contains a NUL byte"))?;

	let c_args: Vec<CString> = args.iter().map(|a| CString::new(a.as_str()).unwrap()).collect();
	let mut argv: Vec<*const libc::c_char> = c_args.iter().map(|a| a.as_ptr()).collect();
	argv.push(std::ptr::null());

	unsafe { libc::execv(c_path.as_ptr(), argv.as_ptr()) };

	error!("execv({path}) failed: {}", std::io::Error::last_os_error());
	Err(())
}

/// Waits for any child to exit or be signalled, returning its pid.
pub fn wait_any() -> Result<libc::pid_t> {
	let mut status = 0;
	let pid = unsafe { libc::waitpid(-1, &mut status, 0) };

	if pid < 0 {
		error!("waitpid() failed: {}", std::io::Error::last_os_error());
		return Err(());
	}

	Ok(pid)
}

/// Sends `SIGTERM` to every process in the calling process's group, then
/// after `grace` with no exits, `SIGKILL`s the group.
pub fn terminate_group(grace: std::time::Duration) {
	unsafe {
		libc::kill(0, libc::SIGTERM);
	}

	std::thread::sleep(grace);

	unsafe {
		libc::kill(0, libc::SIGKILL);
	}
}

/// Sends `payload` on `sock` with `fd` attached as `SCM_RIGHTS` ancillary
/// data: how the proxy hands a freshly connected flow socket to the IFN
/// that owns it, without either side ever seeing the other's listening
/// sockets directly. Returns `Ok(false)` on the nonblocking socket's
/// equivalent of `EAGAIN`; fd handoffs are rare enough that the caller is
/// expected to log and drop rather than queue for retry.
pub fn send_fd(sock: RawFd, payload: &[u8], fd: RawFd) -> Result<bool> {
	let mut iov = libc::iovec { iov_base: payload.as_ptr() as *mut libc::c_void, iov_len: payload.len() };

	let space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as usize;
	let mut cmsg_buf = vec![0u8; space];

	let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
	msg.msg_iov = &mut iov;
	msg.msg_iovlen = 1;
	msg.msg_control = cmsg_buf.as_mut_ptr().cast();
	msg.msg_controllen = cmsg_buf.len() as _;

	// SAFETY: cmsg_buf was sized by CMSG_SPACE for exactly one fd.
	unsafe {
		let cmsg = libc::CMSG_FIRSTHDR(&msg);
		(*cmsg).cmsg_level = libc::SOL_SOCKET;
		(*cmsg).cmsg_type = libc::SCM_RIGHTS;
		(*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as _;
		std::ptr::write(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
	}

	let r = unsafe { libc::sendmsg(sock, &msg, 0) };

	Ok(ret_to_err(r as isize)?.is_some())
}

/// Reads one datagram off `sock` into `buf`, returning the byte count and,
/// if the sender attached one, the first descriptor carried as `SCM_RIGHTS`.
/// `Ok(None)` is the nonblocking socket's equivalent of `EAGAIN`.
pub fn recv_fd(sock: RawFd, buf: &mut [u8]) -> Result<Option<(usize, Option<OwnedFd>)>> {
	let mut iov = libc::iovec { iov_base: buf.as_mut_ptr().cast(), iov_len: buf.len() };

	let space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as usize;
	let mut cmsg_buf = vec![0u8; space];

	let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
	msg.msg_iov = &mut iov;
	msg.msg_iovlen = 1;
	msg.msg_control = cmsg_buf.as_mut_ptr().cast();
	msg.msg_controllen = cmsg_buf.len() as _;

	let n = unsafe { libc::recvmsg(sock, &mut msg, 0) };

	let Some(n) = ret_to_err(n as isize)? else { return Ok(None) };

	// SAFETY: cmsg_buf was populated by the kernel during recvmsg above.
	let fd = unsafe {
		let cmsg = libc::CMSG_FIRSTHDR(&msg);

		if cmsg.is_null() || (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
			None
		} else {
			Some(OwnedFd::from_raw_fd(std::ptr::read(libc::CMSG_DATA(cmsg).cast::<RawFd>())))
		}
	};

	Ok(Some((n, fd)))
}
