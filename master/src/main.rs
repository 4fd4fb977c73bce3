//! The master: the only process that ever reads the configuration file or
//! holds every private key at once, and only for as long as it takes to
//! fork the proxy, the enclave and one interface-worker per configured
//! interface, and hand each its role-minimized slice of the config over a
//! dedicated channel. Once every child has its startup record, the master
//! re-execs itself into an idle supervisor that does nothing but wait for
//! a child to die and tear down the rest of the group.
//!
//! The three worker roles are separate compiled binaries rather than one
//! image re-entered under a mode flag, each with its own small, already
//! fixed descriptor-argument convention (see their own `main`). The master
//! forks and re-execs into those binaries directly; the only re-exec of
//! its own image is the final `-M` transition below.

mod config;
mod proc_util;

use std::ffi::CString;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, InterfaceConfig};
use log::{error, info};
use proto::startup::{self, Role, SCidrAddr, SEos, SIfn, SInit, SPeer, Tag as STag};
use runtime::proc::{self, Socketpair};
use utils::bytes::Cast;

const DEFAULT_CONFIG: &str = "/etc/wireguard-priv/master.toml";
const GRACE: Duration = Duration::from_secs(5);

fn fatal(msg: impl std::fmt::Display) -> ! {
	error!("{msg}");
	std::process::exit(1)
}

struct Opts {
	config_path: String,
	foreground: bool,
	test_only: bool,
	verbose: Option<bool>,
}

fn usage() -> ! {
	eprintln!("usage: master [-d] [-f path] [-n] [-q] [-v] [-h]");
	std::process::exit(2)
}

fn parse_args(args: &[String]) -> Opts {
	let mut opts = Opts { config_path: DEFAULT_CONFIG.to_string(), foreground: false, test_only: false, verbose: None };

	let mut iter = args.iter();
	while let Some(arg) = iter.next() {
		match arg.as_str() {
			"-d" => opts.foreground = true,
			"-n" => opts.test_only = true,
			"-q" => opts.verbose = Some(false),
			"-v" => opts.verbose = Some(true),
			"-h" => usage(),
			"-f" => opts.config_path = iter.next().unwrap_or_else(|| usage()).clone(),
			_ => usage(),
		}
	}

	opts
}

/// Detaches from the controlling terminal: fork, `setsid` in the child, a
/// second fork so the session leader (which could still acquire a new
/// controlling terminal) exits, then redirect stdio to `/dev/null`.
fn daemonize() {
	unsafe {
		match proc::fork() {
			Ok(proc::Forked::Parent { .. }) => std::process::exit(0),
			Ok(proc::Forked::Child) => {}
			Err(()) => fatal("fork() for daemonization failed"),
		}

		if libc::setsid() < 0 {
			fatal("setsid() failed");
		}

		match proc::fork() {
			Ok(proc::Forked::Parent { .. }) => std::process::exit(0),
			Ok(proc::Forked::Child) => {}
			Err(()) => fatal("fork() for daemonization failed"),
		}

		let _ = std::env::set_current_dir("/");

		let devnull_path = CString::new("/dev/null").expect("no NUL bytes in a string literal");
		let devnull = libc::open(devnull_path.as_ptr(), libc::O_RDWR);
		if devnull >= 0 {
			libc::dup2(devnull, 0);
			libc::dup2(devnull, 1);
			libc::dup2(devnull, 2);
			if devnull > 2 {
				libc::close(devnull);
			}
		}
	}
}

/// The pre-fork mesh of `socketpair`s: one configuration channel per child
/// plus the enclave/proxy/ifn cross-channels each sibling binary expects
/// to find already inherited at startup.
struct Mesh {
	proxy_cfg: Socketpair,
	enclave_cfg: Socketpair,
	ifn_cfg: Vec<Socketpair>,
	enclave_proxy: Socketpair,
	enclave_ifn: Vec<Socketpair>,
	proxy_ifn: Vec<Socketpair>,
}

impl Mesh {
	fn build(n: usize) -> Result<Self, String> {
		let sp = || proc::socketpair().map_err(|()| "socketpair() failed".to_string());
		let many = |n: usize| (0..n).map(|_| sp()).collect::<Result<Vec<_>, _>>();

		Ok(Self {
			proxy_cfg: sp()?,
			enclave_cfg: sp()?,
			ifn_cfg: many(n)?,
			enclave_proxy: sp()?,
			enclave_ifn: many(n)?,
			proxy_ifn: many(n)?,
		})
	}
}

fn wsend<T: Cast>(sock: &UnixDatagram, rec: &T) -> Result<(), String> {
	startup::send(sock, rec).map_err(|()| "startup-protocol write failed".to_string())
}

/// Sends one interface's role-minimized record stream (`SIFN` plus its
/// address, listener and peer records) to a single child's channel. Which
/// record categories are sent at all, not just their content, is what
/// keeps the proxy blind to peers and the enclave blind to addresses: both
/// still loop exactly `sifn.n*` times, so a zero count there is a zero
/// iteration count on the receiving end, not a value to be ignored.
fn send_interface(sock: &UnixDatagram, iface: &InterfaceConfig, pubkey: [u8; 32], ifnid: u32, role: Role, owns_tun: bool) -> Result<(), String> {
	let nifaddrs = if role == Role::Proxy { 0 } else { iface.addresses.len() as u32 };
	let nlistenaddrs = if role == Role::Enclave { 0 } else { iface.listeners.len() as u32 };
	let npeers = if role == Role::Proxy { 0 } else { iface.peers.len() as u32 };

	let sifn = SIfn {
		tag: STag::IFN,
		ifnid,
		pubkey,
		privkey: if role == Role::Enclave { *iface.private_key.as_bytes() } else { [0u8; 32] },
		tun_fd: if role == Role::Ifn && owns_tun { iface.tun_fd as i32 } else { 0 },
		port: 0,
		nifaddrs,
		nlistenaddrs,
		npeers,
	};
	wsend(sock, &sifn)?;

	for a in iface.addresses.iter().take(nifaddrs as usize) {
		wsend(sock, &SCidrAddr::new(a.addr, a.prefix_len, a.port))?;
	}

	for l in iface.listeners.iter().take(nlistenaddrs as usize) {
		wsend(sock, &SCidrAddr::new(l.addr, l.prefix_len, l.port))?;
	}

	for (peerid, peer) in iface.peers.iter().enumerate().take(npeers as usize) {
		let endpoint = match peer.endpoint {
			Some(addr) => SCidrAddr::new(addr.ip(), if addr.is_ipv4() { 32 } else { 128 }, addr.port()),
			None => SCidrAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0),
		};

		let speer = SPeer {
			tag: STag::PEER,
			peerid: peerid as u32,
			pubkey: peer.public_key.0,
			psk: if role == Role::Enclave { *peer.preshared_key.as_bytes() } else { [0u8; 32] },
			has_endpoint: peer.endpoint.is_some() as u8,
			endpoint,
			nallowedips: peer.allowed_ips.len() as u32,
		};
		wsend(sock, &speer)?;

		for ip in &peer.allowed_ips {
			wsend(sock, &SCidrAddr::new(ip.addr, ip.prefix_len, ip.port))?;
		}
	}

	Ok(())
}

fn send_startup(cfg: &Config, verbose: bool, proxy_sock: &UnixDatagram, enclave_sock: &UnixDatagram, ifn_socks: &[UnixDatagram]) -> Result<(), String> {
	let nifns = cfg.interfaces.len() as u32;
	let sinit = SInit::new(cfg.background, verbose, cfg.uid, cfg.gid, 0, nifns);

	wsend(proxy_sock, &sinit)?;
	wsend(enclave_sock, &sinit)?;
	for sock in ifn_socks {
		wsend(sock, &sinit)?;
	}

	for (ifnid, iface) in cfg.interfaces.iter().enumerate() {
		let ifnid = ifnid as u32;
		let identity = wireguard::identity::StaticIdentity::new(*iface.private_key.as_bytes());
		let pubkey = *identity.pubkey.as_bytes();

		send_interface(proxy_sock, iface, pubkey, ifnid, Role::Proxy, false)?;
		send_interface(enclave_sock, iface, pubkey, ifnid, Role::Enclave, false)?;

		for (owner_ifnid, sock) in ifn_socks.iter().enumerate() {
			send_interface(sock, iface, pubkey, ifnid, Role::Ifn, owner_ifnid as u32 == ifnid)?;
		}
	}

	wsend(proxy_sock, &SEos::default())?;
	wsend(enclave_sock, &SEos::default())?;
	for sock in ifn_socks {
		wsend(sock, &SEos::default())?;
	}

	Ok(())
}

fn bootstrap(cfg: Config, verbose: bool) -> ! {
	let exe = std::env::current_exe().unwrap_or_else(|err| fatal(format!("current_exe(): {err}")));
	let exe_dir: PathBuf = exe.parent().unwrap_or_else(|| fatal("master binary has no parent directory")).to_path_buf();

	let n = cfg.interfaces.len();
	let mesh = Mesh::build(n).unwrap_or_else(|err| fatal(err));

	let proxy_srcs: Vec<RawFd> = [mesh.proxy_cfg.child.as_raw_fd(), mesh.enclave_proxy.child.as_raw_fd()]
		.into_iter()
		.chain(mesh.proxy_ifn.iter().map(|p| p.parent.as_raw_fd()))
		.collect();
	proc_util::spawn_child(&exe_dir, "proxy", &proxy_srcs, &[n.to_string()]).unwrap_or_else(|err| fatal(err));

	let enclave_srcs: Vec<RawFd> = [mesh.enclave_cfg.child.as_raw_fd(), mesh.enclave_proxy.parent.as_raw_fd()]
		.into_iter()
		.chain(mesh.enclave_ifn.iter().map(|p| p.parent.as_raw_fd()))
		.collect();
	proc_util::spawn_child(&exe_dir, "enclave", &enclave_srcs, &[n.to_string()]).unwrap_or_else(|err| fatal(err));

	for i in 0..n {
		let srcs = [mesh.ifn_cfg[i].child.as_raw_fd(), mesh.enclave_ifn[i].child.as_raw_fd(), mesh.proxy_ifn[i].child.as_raw_fd()];
		proc_util::spawn_child(&exe_dir, "ifn", &srcs, &[i.to_string()]).unwrap_or_else(|err| fatal(err));
	}

	info!("Forked proxy, enclave and {n} ifn(s)");

	let Mesh { proxy_cfg, enclave_cfg, ifn_cfg, .. } = mesh;
	let proxy_sock = UnixDatagram::from(proxy_cfg.parent);
	let enclave_sock = UnixDatagram::from(enclave_cfg.parent);
	let ifn_socks: Vec<UnixDatagram> = ifn_cfg.into_iter().map(|p| UnixDatagram::from(p.parent)).collect();

	send_startup(&cfg, verbose, &proxy_sock, &enclave_sock, &ifn_socks).unwrap_or_else(|err| fatal(err));

	// Config, and every key it held, is dropped here; nothing past this
	// point in the master's own lifetime touches key material again.
	drop(cfg);
	drop((proxy_sock, enclave_sock, ifn_socks));

	reexec_supervisor(&exe);
}

fn reexec_supervisor(exe: &std::path::Path) -> ! {
	let path = exe.to_str().unwrap_or_else(|| fatal("master binary path is not valid UTF-8"));
	let args = vec![path.to_string(), "-M".to_string()];

	let _ = proc::reexec(path, &args);
	std::process::exit(3);
}

/// The idle supervisor the master re-execs itself into once every child is
/// running. Its only job: block for the first child death (it is still
/// every child's parent; `execve` does not change that), then take down
/// whatever is left of the process group.
fn supervise() -> ! {
	match proc::wait_any() {
		Ok(pid) => info!("Child {pid} exited; terminating the process group"),
		Err(()) => info!("Supervisor wait failed; terminating the process group"),
	}

	proc::terminate_group(GRACE);
	std::process::exit(1);
}

fn main() {
	let raw_args: Vec<String> = std::env::args().collect();

	if raw_args.get(1).map(String::as_str) == Some("-M") {
		supervise();
	}

	let opts = parse_args(&raw_args[1..]);
	let cfg = Config::load(&opts.config_path).unwrap_or_else(|err| fatal(err));

	if opts.test_only {
		println!("configuration OK ({} interface(s))", cfg.interfaces.len());
		std::process::exit(0);
	}

	let verbose = opts.verbose.unwrap_or(cfg.verbose);
	runtime::logger::init(verbose);

	if !opts.foreground {
		daemonize();
	}

	bootstrap(cfg, verbose);
}
