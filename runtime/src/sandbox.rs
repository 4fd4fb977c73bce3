//! Resource discipline applied by each privilege-separated child right
//! after it finishes reading its startup configuration, before it trusts
//! anything else it reads. Tight `rlimit`s sized from the child's own
//! workload; the enclave additionally chroots into an empty directory and
//! drops to an unprivileged uid/gid once it no longer needs to open
//! anything by path.

use std::ffi::CString;

use log::{error, warn};

fn fatal(msg: impl std::fmt::Display) -> ! {
	error!("{msg}");
	std::process::exit(1)
}

const MIN_DATA: u64 = 4 << 20;
const PER_PEER_DATA: u64 = 4 << 10;
const STACK_LIMIT: u64 = 1 << 20;
const STDIO_FILES: u64 = 3;

fn set_rlimit(resource: libc::c_int, limit: u64) {
	let rlim = libc::rlimit { rlim_cur: limit, rlim_max: limit };

	// SAFETY: rlim is a plain value struct, resource is a valid RLIMIT_* constant.
	if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
		warn!("setrlimit() failed, the stronger limit was not applied: {}", std::io::Error::last_os_error());
	}
}

/// Caps the data segment (sized from `npeers`), the stack, disables core
/// dumps in release builds, and pins the descriptor ceiling to exactly what
/// this process legitimately holds open (stdio plus `nfiles` channels).
pub fn limit_resources(npeers: u64, nfiles: u64) {
	set_rlimit(libc::RLIMIT_DATA, MIN_DATA + PER_PEER_DATA * npeers);
	set_rlimit(libc::RLIMIT_STACK, STACK_LIMIT);

	if !cfg!(debug_assertions) {
		set_rlimit(libc::RLIMIT_CORE, 0);
	}

	set_rlimit(libc::RLIMIT_NOFILE, STDIO_FILES + nfiles);
}

/// Chroots into `dir` and drops to `uid`/`gid`. Fatal on any failure past
/// the chroot itself: a privilege-drop step that silently no-ops on error
/// defeats the only reason to call it. A no-op when `uid` is zero — the
/// config default, meaning no drop was requested — except the chroot,
/// which is applied unconditionally.
pub fn chroot_and_drop_privileges(dir: &str, uid: u32, gid: u32) {
	let c_dir = CString::new(dir).unwrap_or_else(|_| fatal("chroot path contains a NUL byte"));
	let c_root = CString::new("/").expect("no NUL bytes in a string literal");

	// SAFETY: straight libc calls with valid, NUL-terminated paths.
	unsafe {
		if libc::chroot(c_dir.as_ptr()) != 0 {
			fatal(format!("chroot({dir}) failed: {}", std::io::Error::last_os_error()));
		}

		if libc::chdir(c_root.as_ptr()) != 0 {
			fatal(format!("chdir(\"/\") after chroot failed: {}", std::io::Error::last_os_error()));
		}

		if uid == 0 {
			return;
		}

		if libc::setgid(gid) != 0 {
			fatal(format!("setgid({gid}) failed: {}", std::io::Error::last_os_error()));
		}

		if libc::setuid(uid) != 0 {
			fatal(format!("setuid({uid}) failed: {}", std::io::Error::last_os_error()));
		}
	}
}
