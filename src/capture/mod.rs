//! Capture backends.
//!
//! A [`Provider`] is built once at startup and reports which capture operations it can
//! perform. It opens [`Session`]s, which hand out one [`Packet`] at a time, and each session
//! can produce a [`StatsSource`] that another thread may poll while the session is in use.
//!
//! Two backends exist: [`LibpcapProvider`] for live interfaces through a libpcap loaded at
//! runtime, and [`offline::Offline`] which replays existing capture files.

pub mod live;
pub mod offline;

pub use live::LibpcapProvider;

use crate::{device::Device, linktype::Linktype, packet::Packet, raw::Capability, Error};

/// Snapshot length used when none is configured.
pub const DEFAULT_SNAPLEN: i32 = 65536;
/// Read timeout, in milliseconds, used when none is configured.
pub const DEFAULT_TIMEOUT_MS: i32 = 10;

/// A set of capture operations resolved once from some discovery mechanism.
///
/// Operations the backend lacks fail with [`Error::Unsupported`] instead of panicking.
#[cfg_attr(test, mockall::automock)]
pub trait Provider: Send + Sync {
    /// Whether the backend supplies `capability`.
    fn has(&self, capability: Capability) -> bool;

    /// True when every required capability is present.
    fn is_available(&self) -> bool;

    /// The capabilities that could not be resolved.
    fn missing(&self) -> Vec<Capability>;

    /// Opens a live capture as described by `capture`.
    fn open(&self, capture: &Capture) -> Result<Box<dyn Session>, Error>;

    /// Enumerates capture devices. An empty list is not an error.
    fn devices(&self) -> Result<Vec<Device>, Error>;

    /// The backend's short name for a link type, such as `EN10MB`.
    fn datalink_name(&self, linktype: Linktype) -> Result<String, Error>;

    /// Human-readable description of a link type.
    fn datalink_description(&self, linktype: Linktype) -> Result<String, Error>;

    /// Version banner of the backend library.
    fn version(&self) -> Result<String, Error>;
}

/// An open capture that yields packets.
pub trait Session: Send {
    /// Link-layer type of every packet this session produces.
    fn datalink(&self) -> Linktype;

    /// Maximum number of bytes captured per packet.
    fn snaplen(&self) -> u32;

    /// Blocks until a packet arrives or the read timeout expires.
    ///
    /// Returns [`Error::TimeoutExpired`] when no packet arrived in time and
    /// [`Error::NoMorePackets`] when a finite source is exhausted. The packet borrows the
    /// session's buffer and is only valid until the next call.
    fn next_packet(&mut self) -> Result<Packet<'_>, Error>;

    /// Installs a BPF filter expression.
    fn filter(&mut self, program: &str, optimize: bool) -> Result<(), Error>;

    /// A handle that reads this session's statistics from another thread.
    fn stats_source(&self) -> Box<dyn StatsSource>;

    /// Interface name or file the session reads from.
    fn name(&self) -> &str;
}

/// Reads capture statistics. Implementations must tolerate being polled concurrently with
/// [`Session::next_packet`].
#[cfg_attr(test, mockall::automock)]
pub trait StatsSource: Send {
    fn stats(&self) -> Result<Stat, Error>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// Packet statistics for a capture
pub struct Stat {
    /// Number of packets received
    pub received: u32,
    /// Number of packets dropped because there was no room in the operating system's buffer when
    /// they arrived, because packets weren't being read fast enough
    pub dropped: u32,
    /// Number of packets dropped by the network interface or its driver
    pub if_dropped: u32,
}

impl Stat {
    pub fn new(received: u32, dropped: u32, if_dropped: u32) -> Stat {
        Stat {
            received,
            dropped,
            if_dropped,
        }
    }

    /// Drops counted anywhere between the wire and the capture buffer.
    pub fn total_dropped(&self) -> u64 {
        self.dropped as u64 + self.if_dropped as u64
    }
}

/// Parameters for opening a live capture.
///
/// # Example
/// ```no_run
/// use packetdump::{Capture, LibpcapProvider};
///
/// let session = Capture::from_device("eth0")
///     .snaplen(1500)
///     .promisc(false)
///     .timeout(100)
///     .open(LibpcapProvider::shared())
///     .unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    device: Device,
    snaplen: i32,
    promisc: bool,
    timeout: i32,
    rfmon: bool,
}

impl Capture {
    /// Describes a capture on `device`. You can pass a `Device` or an `&str` device name.
    /// Promiscuous mode is on by default.
    pub fn from_device<D: Into<Device>>(device: D) -> Capture {
        Capture {
            device: device.into(),
            snaplen: DEFAULT_SNAPLEN,
            promisc: true,
            timeout: DEFAULT_TIMEOUT_MS,
            rfmon: false,
        }
    }

    /// Set the snaplen size (the maximum length of a packet captured into the buffer).
    pub fn snaplen(mut self, to: i32) -> Capture {
        self.snaplen = to;
        self
    }

    /// Set promiscuous mode on or off.
    pub fn promisc(mut self, to: bool) -> Capture {
        self.promisc = to;
        self
    }

    /// Set the read timeout in milliseconds.
    pub fn timeout(mut self, ms: i32) -> Capture {
        self.timeout = ms;
        self
    }

    /// Set rfmon mode on or off. Only wireless interfaces support it.
    pub fn rfmon(mut self, to: bool) -> Capture {
        self.rfmon = to;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn get_snaplen(&self) -> i32 {
        self.snaplen
    }

    pub fn is_promisc(&self) -> bool {
        self.promisc
    }

    pub fn get_timeout(&self) -> i32 {
        self.timeout
    }

    pub fn is_rfmon(&self) -> bool {
        self.rfmon
    }

    /// Opens the capture through `provider`.
    pub fn open(self, provider: &dyn Provider) -> Result<Box<dyn Session>, Error> {
        provider.open(&self)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_defaults() {
        let capture = Capture::from_device("eth0");
        assert_eq!(capture.device().name, "eth0");
        assert_eq!(capture.get_snaplen(), 65536);
        assert!(capture.is_promisc());
        assert_eq!(capture.get_timeout(), 10);
        assert!(!capture.is_rfmon());
    }

    #[test]
    fn test_capture_open_goes_through_provider() {
        let mut provider = MockProvider::new();
        provider
            .expect_open()
            .withf(|c| c.device().name == "wlan0" && c.is_rfmon() && !c.is_promisc())
            .return_once(|c| {
                Err(Error::CaptureUnavailable {
                    interface: c.device().name.clone(),
                    message: "That device doesn't support monitor mode".to_string(),
                })
            });

        let result = Capture::from_device("wlan0")
            .promisc(false)
            .rfmon(true)
            .open(&provider);
        assert!(matches!(
            result,
            Err(Error::CaptureUnavailable { ref interface, .. }) if interface == "wlan0"
        ));
    }

    #[test]
    fn test_stat_total_dropped() {
        let stat = Stat::new(10, u32::MAX, 3);
        assert_eq!(stat.total_dropped(), u32::MAX as u64 + 3);
    }

    #[test]
    fn test_scripted_session() {
        let mut session = testmod::ScriptedSession::packets(&[(1, 4)]);
        let stats = session.stats_source();
        assert_eq!(session.next_packet().unwrap().data, &[0xab; 4]);
        assert!(matches!(session.next_packet(), Err(Error::NoMorePackets)));
        assert_eq!(stats.stats().unwrap().received, 1);
    }
}
