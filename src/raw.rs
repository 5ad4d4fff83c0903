//! Runtime binding of libpcap.
//!
//! libpcap is loaded with `libloading` when the process starts instead of being linked at
//! build time, so the binary builds without libpcap development files and still runs (with
//! reduced capabilities) on hosts where some symbols are missing. Every symbol is bound on
//! its own: a missing symbol is recorded and the corresponding capability reported as
//! unavailable, it never aborts the whole binding.

#![allow(non_camel_case_types)]

use std::{env, fmt, path::PathBuf};

use libc::{c_char, c_int, c_uchar, c_uint};
use libloading::Library;

pub const PCAP_ERRBUF_SIZE: usize = 256;

pub const PCAP_IF_LOOPBACK: u32 = 0x0000_0001;
pub const PCAP_IF_UP: u32 = 0x0000_0002;
pub const PCAP_IF_RUNNING: u32 = 0x0000_0004;
pub const PCAP_IF_WIRELESS: u32 = 0x0000_0008;

pub enum pcap_t {}

pub enum pcap_addr_t {}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct pcap_pkthdr {
    pub ts: libc::timeval,
    pub caplen: u32,
    pub len: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct pcap_stat {
    pub ps_recv: c_uint,
    pub ps_drop: c_uint,
    pub ps_ifdrop: c_uint,
    // WinPcap appends ps_capt; keep room for it.
    #[cfg(windows)]
    pub ps_capt: c_uint,
}

#[repr(C)]
pub struct pcap_if_t {
    pub next: *mut pcap_if_t,
    pub name: *mut c_char,
    pub description: *mut c_char,
    pub addresses: *mut pcap_addr_t,
    pub flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct bpf_insn {
    pub code: u16,
    pub jt: c_uchar,
    pub jf: c_uchar,
    pub k: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct bpf_program {
    pub bf_len: c_uint,
    pub bf_insns: *mut bpf_insn,
}

impl Default for bpf_program {
    fn default() -> Self {
        bpf_program {
            bf_len: 0,
            bf_insns: std::ptr::null_mut(),
        }
    }
}

pub type PcapOpenLive = unsafe extern "C" fn(
    device: *const c_char,
    snaplen: c_int,
    promisc: c_int,
    to_ms: c_int,
    errbuf: *mut c_char,
) -> *mut pcap_t;
pub type PcapCreate = unsafe extern "C" fn(arg1: *const c_char, arg2: *mut c_char) -> *mut pcap_t;
pub type PcapSetInt = unsafe extern "C" fn(arg1: *mut pcap_t, arg2: c_int) -> c_int;
pub type PcapActivate = unsafe extern "C" fn(arg1: *mut pcap_t) -> c_int;
pub type PcapClose = unsafe extern "C" fn(arg1: *mut pcap_t);
pub type PcapNextEx = unsafe extern "C" fn(
    arg1: *mut pcap_t,
    arg2: *mut *mut pcap_pkthdr,
    arg3: *mut *const c_uchar,
) -> c_int;
pub type PcapStats = unsafe extern "C" fn(arg1: *mut pcap_t, arg2: *mut pcap_stat) -> c_int;
pub type PcapFindalldevs =
    unsafe extern "C" fn(arg1: *mut *mut pcap_if_t, arg2: *mut c_char) -> c_int;
pub type PcapFreealldevs = unsafe extern "C" fn(arg1: *mut pcap_if_t);
pub type PcapDatalink = unsafe extern "C" fn(arg1: *mut pcap_t) -> c_int;
pub type PcapDatalinkValToStr = unsafe extern "C" fn(arg1: c_int) -> *const c_char;
pub type PcapGeterr = unsafe extern "C" fn(arg1: *mut pcap_t) -> *mut c_char;
pub type PcapCompile = unsafe extern "C" fn(
    arg1: *mut pcap_t,
    arg2: *mut bpf_program,
    arg3: *const c_char,
    arg4: c_int,
    arg5: c_uint,
) -> c_int;
pub type PcapSetfilter = unsafe extern "C" fn(arg1: *mut pcap_t, arg2: *mut bpf_program) -> c_int;
pub type PcapFreecode = unsafe extern "C" fn(arg1: *mut bpf_program);
pub type PcapLibVersion = unsafe extern "C" fn() -> *const c_char;

/// One operation the capture library may or may not supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    OpenLive,
    Close,
    NextPacket,
    Stats,
    FindAllDevs,
    FreeAllDevs,
    Datalink,
    DatalinkName,
    GetErr,
    DatalinkDescription,
    Compile,
    SetFilter,
    FreeCode,
    Create,
    SetSnaplen,
    SetPromisc,
    SetTimeout,
    SetRfmon,
    Activate,
    LibVersion,
}

impl Capability {
    /// The operations a capture run cannot do without.
    pub const REQUIRED: [Capability; 9] = [
        Capability::OpenLive,
        Capability::Close,
        Capability::NextPacket,
        Capability::Stats,
        Capability::FindAllDevs,
        Capability::FreeAllDevs,
        Capability::Datalink,
        Capability::DatalinkName,
        Capability::GetErr,
    ];

    pub fn is_required(self) -> bool {
        Capability::REQUIRED.contains(&self)
    }

    /// The C symbol backing this capability.
    pub fn symbol(self) -> &'static str {
        match self {
            Capability::OpenLive => "pcap_open_live",
            Capability::Close => "pcap_close",
            Capability::NextPacket => "pcap_next_ex",
            Capability::Stats => "pcap_stats",
            Capability::FindAllDevs => "pcap_findalldevs",
            Capability::FreeAllDevs => "pcap_freealldevs",
            Capability::Datalink => "pcap_datalink",
            Capability::DatalinkName => "pcap_datalink_val_to_name",
            Capability::GetErr => "pcap_geterr",
            Capability::DatalinkDescription => "pcap_datalink_val_to_description",
            Capability::Compile => "pcap_compile",
            Capability::SetFilter => "pcap_setfilter",
            Capability::FreeCode => "pcap_freecode",
            Capability::Create => "pcap_create",
            Capability::SetSnaplen => "pcap_set_snaplen",
            Capability::SetPromisc => "pcap_set_promisc",
            Capability::SetTimeout => "pcap_set_timeout",
            Capability::SetRfmon => "pcap_set_rfmon",
            Capability::Activate => "pcap_activate",
            Capability::LibVersion => "pcap_lib_version",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// The bound function table. Each entry is `None` when the symbol could not be resolved.
///
/// The function pointers stay valid for as long as `_library` is loaded, which is the
/// lifetime of this struct.
pub struct PcapLibrary {
    _library: Option<Library>,
    load_error: Option<String>,
    missing: Vec<Capability>,
    pub open_live: Option<PcapOpenLive>,
    pub close: Option<PcapClose>,
    pub next_ex: Option<PcapNextEx>,
    pub stats: Option<PcapStats>,
    pub findalldevs: Option<PcapFindalldevs>,
    pub freealldevs: Option<PcapFreealldevs>,
    pub datalink: Option<PcapDatalink>,
    pub datalink_val_to_name: Option<PcapDatalinkValToStr>,
    pub datalink_val_to_description: Option<PcapDatalinkValToStr>,
    pub geterr: Option<PcapGeterr>,
    pub compile: Option<PcapCompile>,
    pub setfilter: Option<PcapSetfilter>,
    pub freecode: Option<PcapFreecode>,
    pub create: Option<PcapCreate>,
    pub set_snaplen: Option<PcapSetInt>,
    pub set_promisc: Option<PcapSetInt>,
    pub set_timeout: Option<PcapSetInt>,
    pub set_rfmon: Option<PcapSetInt>,
    pub activate: Option<PcapActivate>,
    pub lib_version: Option<PcapLibVersion>,
}

// The table only holds plain function pointers into a library that is never unloaded
// while the table is alive.
unsafe impl Send for PcapLibrary {}
unsafe impl Sync for PcapLibrary {}

macro_rules! bind {
    ($lib:expr, $missing:expr, $cap:expr) => {{
        let cap: Capability = $cap;
        let name = format!("{}\0", cap.symbol());
        match unsafe { $lib.get(name.as_bytes()) } {
            Ok(sym) => Some(*sym),
            Err(_) => {
                $missing.push(cap);
                None
            }
        }
    }};
}

impl PcapLibrary {
    /// Loads libpcap from the first candidate path that opens. Symbols it lacks are recorded
    /// in [`PcapLibrary::missing`] rather than rejecting the library.
    pub fn load() -> PcapLibrary {
        let mut last_error = None;
        for candidate in candidates() {
            match unsafe { Library::new(&candidate) } {
                Ok(library) => return PcapLibrary::bind(library),
                Err(e) => last_error = Some(format!("{}: {}", candidate.display(), e)),
            }
        }
        PcapLibrary::unloaded(
            last_error.unwrap_or_else(|| "no candidate library paths".to_string()),
        )
    }

    /// A table with every capability missing, remembering why the library didn't load.
    pub fn unloaded(reason: String) -> PcapLibrary {
        PcapLibrary {
            _library: None,
            load_error: Some(reason),
            missing: all_capabilities().to_vec(),
            open_live: None,
            close: None,
            next_ex: None,
            stats: None,
            findalldevs: None,
            freealldevs: None,
            datalink: None,
            datalink_val_to_name: None,
            datalink_val_to_description: None,
            geterr: None,
            compile: None,
            setfilter: None,
            freecode: None,
            create: None,
            set_snaplen: None,
            set_promisc: None,
            set_timeout: None,
            set_rfmon: None,
            activate: None,
            lib_version: None,
        }
    }

    fn bind(library: Library) -> PcapLibrary {
        let mut missing = Vec::new();
        PcapLibrary {
            open_live: bind!(library, missing, Capability::OpenLive),
            close: bind!(library, missing, Capability::Close),
            next_ex: bind!(library, missing, Capability::NextPacket),
            stats: bind!(library, missing, Capability::Stats),
            findalldevs: bind!(library, missing, Capability::FindAllDevs),
            freealldevs: bind!(library, missing, Capability::FreeAllDevs),
            datalink: bind!(library, missing, Capability::Datalink),
            datalink_val_to_name: bind!(library, missing, Capability::DatalinkName),
            datalink_val_to_description: bind!(
                library,
                missing,
                Capability::DatalinkDescription
            ),
            geterr: bind!(library, missing, Capability::GetErr),
            compile: bind!(library, missing, Capability::Compile),
            setfilter: bind!(library, missing, Capability::SetFilter),
            freecode: bind!(library, missing, Capability::FreeCode),
            create: bind!(library, missing, Capability::Create),
            set_snaplen: bind!(library, missing, Capability::SetSnaplen),
            set_promisc: bind!(library, missing, Capability::SetPromisc),
            set_timeout: bind!(library, missing, Capability::SetTimeout),
            set_rfmon: bind!(library, missing, Capability::SetRfmon),
            activate: bind!(library, missing, Capability::Activate),
            lib_version: bind!(library, missing, Capability::LibVersion),
            missing,
            load_error: None,
            _library: Some(library),
        }
    }

    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }

    pub fn missing(&self) -> &[Capability] {
        &self.missing
    }
}

fn all_capabilities() -> [Capability; 20] {
    [
        Capability::OpenLive,
        Capability::Close,
        Capability::NextPacket,
        Capability::Stats,
        Capability::FindAllDevs,
        Capability::FreeAllDevs,
        Capability::Datalink,
        Capability::DatalinkName,
        Capability::GetErr,
        Capability::DatalinkDescription,
        Capability::Compile,
        Capability::SetFilter,
        Capability::FreeCode,
        Capability::Create,
        Capability::SetSnaplen,
        Capability::SetPromisc,
        Capability::SetTimeout,
        Capability::SetRfmon,
        Capability::Activate,
        Capability::LibVersion,
    ]
}

#[cfg(windows)]
const LIBRARY_NAMES: &[&str] = &["wpcap.dll"];
#[cfg(target_os = "macos")]
const LIBRARY_NAMES: &[&str] = &["libpcap.A.dylib", "libpcap.dylib"];
#[cfg(all(not(windows), not(target_os = "macos")))]
const LIBRARY_NAMES: &[&str] = &["libpcap.so.1", "libpcap.so.0.8", "libpcap.so"];

fn candidates() -> Vec<PathBuf> {
    let libdir = env::var("LIBPCAP_LIBDIR").ok().map(PathBuf::from);
    LIBRARY_NAMES
        .iter()
        .map(|name| match &libdir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unloaded_library_misses_everything() {
        let lib = PcapLibrary::unloaded("not here".to_string());
        assert_eq!(lib.load_error(), Some("not here"));
        for cap in Capability::REQUIRED {
            assert!(lib.missing().contains(&cap));
        }
        assert!(lib.open_live.is_none());
        assert!(lib.stats.is_none());
    }

    #[test]
    fn required_capabilities() {
        assert!(Capability::OpenLive.is_required());
        assert!(Capability::Stats.is_required());
        assert!(!Capability::Compile.is_required());
        assert!(!Capability::SetRfmon.is_required());
        assert_eq!(Capability::NextPacket.to_string(), "pcap_next_ex");
    }

    #[test]
    fn candidates_honour_libdir() {
        env::set_var("LIBPCAP_LIBDIR", "/opt/pcap/lib");
        let paths = candidates();
        env::remove_var("LIBPCAP_LIBDIR");
        assert!(!paths.is_empty());
        assert!(paths.iter().all(|p| p.starts_with("/opt/pcap/lib")));
    }

    #[test]
    fn all_capabilities_are_distinct() {
        let all = all_capabilities();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.symbol(), b.symbol());
            }
        }
    }
}
