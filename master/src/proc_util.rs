//! Fork + fd-rebase + re-exec: how the master turns a pre-built mesh of
//! `socketpair`s into a running sibling binary with its channels landed at
//! the exact descriptor numbers that binary's own `main` expects.

use std::os::fd::RawFd;
use std::path::Path;

use runtime::proc::{self, Forked};

/// Every spawned child's inherited channels start here, right after stdio.
pub const CHILD_BASE: RawFd = 3;

/// Rearranges `srcs` into the contiguous range `[CHILD_BASE, CHILD_BASE +
/// srcs.len())`, in order, and closes every other descriptor above stdio.
/// Dups through a scratch range first so a source fd that already lands
/// inside the target range isn't clobbered before it's copied.
///
/// # Safety
/// Only async-signal-safe operations are permitted here: the caller must
/// be in the child branch of a fresh `fork`, with no further Rust-level
/// allocation before the following `reexec`.
unsafe fn rebase_fds(srcs: &[RawFd]) {
	let n = srcs.len() as RawFd;
	let scratch = CHILD_BASE + n + 64;

	for (i, &fd) in srcs.iter().enumerate() {
		libc::dup2(fd, scratch + i as RawFd);
	}

	for i in 0..n {
		libc::dup2(scratch + i, CHILD_BASE + i);
	}

	let mut fd: RawFd = 3;
	while fd < 1024 {
		if fd < CHILD_BASE || fd >= CHILD_BASE + n {
			libc::close(fd);
		}
		fd += 1;
	}
}

/// Forks, and in the child rebases `srcs` to `CHILD_BASE..` and re-execs
/// `exe_dir/name` with `[CHILD_BASE, extra_args...]` as its arguments.
/// Returns the child's pid to the parent.
pub fn spawn_child(exe_dir: &Path, name: &str, srcs: &[RawFd], extra_args: &[String]) -> Result<libc::pid_t, String> {
	let path = exe_dir.join(name);
	let path = path.to_str().ok_or_else(|| format!("{name} binary path is not valid UTF-8"))?.to_string();

	// SAFETY: the child branch below only dups/closes descriptors and
	// re-execs; no other Rust state is touched before the image is replaced.
	match unsafe { proc::fork() } {
		Err(()) => Err(format!("fork() for {name} failed")),
		Ok(Forked::Parent { pid }) => Ok(pid),
		Ok(Forked::Child) => {
			unsafe { rebase_fds(srcs) };

			let mut args = vec![path.clone(), CHILD_BASE.to_string()];
			args.extend(extra_args.iter().cloned());

			let _ = proc::reexec(&path, &args);
			// reexec() only returns on failure; a child that can't become
			// what it was forked to be must not fall back into the parent's
			// code path.
			std::process::exit(3);
		}
	}
}
