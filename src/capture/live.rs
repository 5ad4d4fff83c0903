use std::{
    ffi::CString,
    fmt, mem,
    ptr::{self, NonNull},
    slice,
    sync::{Arc, Weak},
};

use once_cell::sync::Lazy;

use crate::{
    capture::{Capture, Provider, Session, Stat, StatsSource},
    cstr_to_string,
    device::Device,
    linktype::Linktype,
    packet::{Packet, PacketHeader},
    raw::{self, Capability, PcapLibrary},
    Error,
};

static SHARED: Lazy<LibpcapProvider> = Lazy::new(LibpcapProvider::load);

const PCAP_NETMASK_UNKNOWN: libc::c_uint = 0xffff_ffff;

/// Live capture through a libpcap loaded at runtime.
///
/// Every libpcap symbol is bound independently, so an old or stripped library still
/// supports whatever it does export.
#[derive(Clone)]
pub struct LibpcapProvider {
    lib: Arc<PcapLibrary>,
}

impl fmt::Debug for LibpcapProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibpcapProvider")
            .field("load_error", &self.lib.load_error())
            .field("missing", &self.lib.missing())
            .finish()
    }
}

impl LibpcapProvider {
    /// The process-wide provider, loaded on first use.
    pub fn shared() -> &'static LibpcapProvider {
        &SHARED
    }

    /// Loads libpcap from `LIBPCAP_LIBDIR` or the platform's usual locations.
    pub fn load() -> LibpcapProvider {
        let lib = PcapLibrary::load();
        match lib.load_error() {
            Some(e) => tracing::debug!("libpcap not loaded: {}", e),
            None if !lib.missing().is_empty() => {
                tracing::debug!("libpcap loaded without {:?}", lib.missing())
            }
            None => tracing::trace!("libpcap loaded"),
        }
        LibpcapProvider { lib: Arc::new(lib) }
    }

    fn from_library(lib: PcapLibrary) -> LibpcapProvider {
        LibpcapProvider { lib: Arc::new(lib) }
    }

    /// Why the library could not be loaded, if it couldn't.
    pub fn load_error(&self) -> Option<&str> {
        self.lib.load_error()
    }

    fn require<T>(&self, func: Option<T>, capability: Capability) -> Result<T, Error> {
        require(&self.lib, func, capability)
    }

    fn open_live(&self, capture: &Capture, name: &CString) -> Result<PcapHandle, Error> {
        let open_live = self.require(self.lib.open_live, Capability::OpenLive)?;
        Error::with_errbuf(|errbuf| {
            let handle = unsafe {
                open_live(
                    name.as_ptr(),
                    capture.get_snaplen(),
                    capture.is_promisc() as _,
                    capture.get_timeout(),
                    errbuf,
                )
            };
            NonNull::new(handle).ok_or_else(|| unavailable(capture, errbuf))
        })
        .map(|handle| PcapHandle {
            handle,
            lib: self.lib.clone(),
        })
    }

    // Monitor mode can only be requested before activation, so this takes the
    // create/set/activate route instead of pcap_open_live.
    fn create_and_activate(
        &self,
        capture: &Capture,
        name: &CString,
    ) -> Result<PcapHandle, Error> {
        let create = self.require(self.lib.create, Capability::Create)?;
        let set_snaplen = self.require(self.lib.set_snaplen, Capability::SetSnaplen)?;
        let set_promisc = self.require(self.lib.set_promisc, Capability::SetPromisc)?;
        let set_timeout = self.require(self.lib.set_timeout, Capability::SetTimeout)?;
        let set_rfmon = self.require(self.lib.set_rfmon, Capability::SetRfmon)?;
        let activate = self.require(self.lib.activate, Capability::Activate)?;

        let handle = Error::with_errbuf(|errbuf| {
            let handle = unsafe { create(name.as_ptr(), errbuf) };
            NonNull::new(handle).ok_or_else(|| unavailable(capture, errbuf))
        })?;
        let handle = PcapHandle {
            handle,
            lib: self.lib.clone(),
        };
        unsafe {
            set_snaplen(handle.as_ptr(), capture.get_snaplen());
            set_promisc(handle.as_ptr(), capture.is_promisc() as _);
            set_timeout(handle.as_ptr(), capture.get_timeout());
            set_rfmon(handle.as_ptr(), 1);
        }
        // warnings are positive, errors negative
        if unsafe { activate(handle.as_ptr()) } < 0 {
            return Err(Error::CaptureUnavailable {
                interface: capture.device().name.clone(),
                message: handle.last_error(),
            });
        }
        Ok(handle)
    }
}

impl Provider for LibpcapProvider {
    fn has(&self, capability: Capability) -> bool {
        self.lib.load_error().is_none() && !self.lib.missing().contains(&capability)
    }

    fn is_available(&self) -> bool {
        self.lib.load_error().is_none() && !self.lib.missing().iter().any(|c| c.is_required())
    }

    fn missing(&self) -> Vec<Capability> {
        self.lib.missing().to_vec()
    }

    fn open(&self, capture: &Capture) -> Result<Box<dyn Session>, Error> {
        let name = CString::new(capture.device().name.as_str())?;
        let handle = if capture.is_rfmon() {
            self.create_and_activate(capture, &name)?
        } else {
            self.open_live(capture, &name)?
        };
        let handle = Arc::new(handle);

        let datalink = self.require(self.lib.datalink, Capability::Datalink)?;
        let linktype = Linktype(unsafe { datalink(handle.as_ptr()) });
        tracing::debug!(
            "opened {} ({}, snaplen {})",
            capture.device().name,
            linktype,
            capture.get_snaplen()
        );
        Ok(Box::new(LiveSession {
            handle,
            name: capture.device().name.clone(),
            linktype,
            snaplen: capture.get_snaplen() as u32,
        }))
    }

    fn devices(&self) -> Result<Vec<Device>, Error> {
        let findalldevs = self.require(self.lib.findalldevs, Capability::FindAllDevs)?;
        let freealldevs = self.require(self.lib.freealldevs, Capability::FreeAllDevs)?;
        Error::with_errbuf(|errbuf| {
            let mut dev_buf: *mut raw::pcap_if_t = ptr::null_mut();
            if unsafe { findalldevs(&mut dev_buf, errbuf) } != 0 {
                return Err(unsafe { Error::new(errbuf) });
            }
            let result = (|| -> Result<Vec<Device>, Error> {
                let mut devices = vec![];
                let mut cur = dev_buf;
                while !cur.is_null() {
                    let dev = unsafe { &*cur };
                    devices.push(Device::try_from(dev)?);
                    cur = dev.next;
                }
                Ok(devices)
            })();
            if !dev_buf.is_null() {
                unsafe { freealldevs(dev_buf) };
            }
            result
        })
    }

    fn datalink_name(&self, linktype: Linktype) -> Result<String, Error> {
        let to_name = self.require(self.lib.datalink_val_to_name, Capability::DatalinkName)?;
        unsafe { cstr_to_string(to_name(linktype.0))?.ok_or(Error::InvalidString) }
    }

    fn datalink_description(&self, linktype: Linktype) -> Result<String, Error> {
        let to_description = self.require(
            self.lib.datalink_val_to_description,
            Capability::DatalinkDescription,
        )?;
        unsafe { cstr_to_string(to_description(linktype.0))?.ok_or(Error::InvalidString) }
    }

        fn version(&self) -> Result<String, Error> {
        let lib_version = self.require(self.lib.lib_version, Capability::LibVersion)?;
        unsafe { cstr_to_string(lib_version())?.ok_or(Error::InvalidString) }
    }
}

fn require<T>(lib: &PcapLibrary, func: Option<T>, capability: Capability) -> Result<T, Error> {
    match (func, lib.load_error()) {
        (Some(func), _) => Ok(func),
        (None, Some(reason)) => Err(Error::LibraryUnavailable(reason.to_string())),
        (None, None) => Err(Error::Unsupported(capability)),
    }
}

fn unavailable(capture: &Capture, errbuf: *mut libc::c_char) -> Error {
    let message = unsafe { cstr_to_string(errbuf) }
        .ok()
        .flatten()
        .unwrap_or_default();
    Error::CaptureUnavailable {
        interface: capture.device().name.clone(),
        message,
    }
}

/// Owns a `pcap_t` and closes it on drop.
struct PcapHandle {
    handle: NonNull<raw::pcap_t>,
    lib: Arc<PcapLibrary>,
}

impl PcapHandle {
    fn as_ptr(&self) -> *mut raw::pcap_t {
        self.handle.as_ptr()
    }

    fn last_error(&self) -> String {
        match self.lib.geterr {
            Some(geterr) => unsafe { cstr_to_string(geterr(self.as_ptr())) }
                .ok()
                .flatten()
                .unwrap_or_default(),
            None => "unknown libpcap error".to_string(),
        }
    }

    fn get_err(&self) -> Error {
        match self.lib.geterr {
            Some(geterr) => unsafe { Error::new(geterr(self.as_ptr())) },
            None => Error::PcapError(self.last_error()),
        }
    }
}

// `PcapHandle` is safe to Send as it encapsulates the entire lifetime of `raw::pcap_t *`, but it
// is not safe to Sync as libpcap does not promise thread-safe access to the same `raw::pcap_t *`
// from multiple threads.
unsafe impl Send for PcapHandle {}

impl Drop for PcapHandle {
    fn drop(&mut self) {
        if let Some(close) = self.lib.close {
            unsafe { close(self.handle.as_ptr()) }
        }
    }
}

/// A session on a live interface.
pub struct LiveSession {
    handle: Arc<PcapHandle>,
    name: String,
    linktype: Linktype,
    snaplen: u32,
}

// The session is the only strong owner of the handle; `LiveStats` only upgrades its weak
// reference for the duration of one pcap_stats call.
unsafe impl Send for LiveSession {}

impl Session for LiveSession {
    fn datalink(&self) -> Linktype {
        self.linktype
    }

    fn snaplen(&self) -> u32 {
        self.snaplen
    }

    fn next_packet(&mut self) -> Result<Packet<'_>, Error> {
        let next_ex = require(&self.handle.lib, self.handle.lib.next_ex, Capability::NextPacket)?;
        unsafe {
            let mut header: *mut raw::pcap_pkthdr = ptr::null_mut();
            let mut packet: *const libc::c_uchar = ptr::null();
            let retcode = next_ex(self.handle.as_ptr(), &mut header, &mut packet);
            match retcode {
                i if i >= 1 => Ok(Packet::new(
                    &*(&*header as *const raw::pcap_pkthdr as *const PacketHeader),
                    slice::from_raw_parts(packet, (*header).caplen as _),
                )),
                0 => Err(Error::TimeoutExpired),
                -2 => Err(Error::NoMorePackets),
                _ => Err(Error::ReadFailure(self.handle.last_error())),
            }
        }
    }

    fn filter(&mut self, program: &str, optimize: bool) -> Result<(), Error> {
        let lib = &self.handle.lib;
        let compile = require(lib, lib.compile, Capability::Compile)?;
        let setfilter = require(lib, lib.setfilter, Capability::SetFilter)?;
        let freecode = require(lib, lib.freecode, Capability::FreeCode)?;

        let program = CString::new(program)?;
        unsafe {
            let mut bpf_program: raw::bpf_program = mem::zeroed();
            if compile(
                self.handle.as_ptr(),
                &mut bpf_program,
                program.as_ptr(),
                optimize as libc::c_int,
                PCAP_NETMASK_UNKNOWN,
            ) == -1
            {
                return Err(self.handle.get_err());
            }
            let ret = setfilter(self.handle.as_ptr(), &mut bpf_program);
            freecode(&mut bpf_program);
            if ret == -1 {
                return Err(self.handle.get_err());
            }
        }
        Ok(())
    }

    fn stats_source(&self) -> Box<dyn StatsSource> {
        Box::new(LiveStats {
            handle: Arc::downgrade(&self.handle),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Polls `pcap_stats` for a session that may be closed underneath it.
pub struct LiveStats {
    handle: Weak<PcapHandle>,
}

// pcap_stats only reads counters the kernel maintains for the socket, it does not touch the
// packet buffer that pcap_next_ex fills.
unsafe impl Send for LiveStats {}

impl StatsSource for LiveStats {
    fn stats(&self) -> Result<Stat, Error> {
        let handle = match self.handle.upgrade() {
            Some(handle) => handle,
            None => return Err(Error::ReadFailure("capture closed".to_string())),
        };
        let stats = require(&handle.lib, handle.lib.stats, Capability::Stats)?;
        unsafe {
            let mut stat: raw::pcap_stat = mem::zeroed();
            if stats(handle.as_ptr(), &mut stat) == -1 {
                return Err(handle.get_err());
            }
            Ok(Stat::new(stat.ps_recv, stat.ps_drop, stat.ps_ifdrop))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unloaded() -> LibpcapProvider {
        LibpcapProvider::from_library(PcapLibrary::unloaded("libpcap.so: not found".to_string()))
    }

    #[test]
    fn test_unloaded_is_unavailable() {
        let provider = unloaded();
        assert!(!provider.is_available());
        assert!(!provider.has(Capability::OpenLive));
        assert_eq!(provider.missing().len(), 20);
        assert_eq!(provider.load_error(), Some("libpcap.so: not found"));
    }

    #[test]
    fn test_unloaded_operations_fail_without_panicking() {
        let provider = unloaded();
        assert!(matches!(
            provider.devices(),
            Err(Error::LibraryUnavailable(_))
        ));
        assert!(matches!(
            Capture::from_device("eth0").open(&provider),
            Err(Error::LibraryUnavailable(_))
        ));
        assert!(provider.datalink_name(Linktype::ETHERNET).is_err());
        assert!(provider.datalink_description(Linktype::ETHERNET).is_err());
        assert!(provider.version().is_err());
    }

    #[test]
    fn test_require() {
        let lib = PcapLibrary::unloaded("gone".to_string());
        assert!(matches!(
            require::<u8>(&lib, None, Capability::Stats),
            Err(Error::LibraryUnavailable(ref s)) if s == "gone"
        ));
        assert_eq!(require(&lib, Some(7u8), Capability::Stats).unwrap(), 7);
    }

    #[test]
    fn test_interior_nul_in_device_name() {
        let provider = unloaded();
        assert!(matches!(
            Capture::from_device("et\0h0").open(&provider),
            Err(Error::InvalidInputString)
        ));
    }

    #[test]
    fn test_shared_is_stable() {
        assert!(ptr::eq(LibpcapProvider::shared(), LibpcapProvider::shared()));
    }
}
