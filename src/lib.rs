//! packetdump captures packets from a live interface and stores them as a sequence of
//! rotating pcap files, optionally compressed with LZ4.
//!
//! The pipeline is:
//!
//! * a [`Provider`] binds the capture library at runtime and opens a [`Session`],
//! * the capture loop ([`dump::dump`]) pulls [`Packet`]s from the session,
//! * a [`Rotator`] decides per packet whether the current file must be closed, names new
//!   files with a [`template`] expanded from the packet's own timestamp, and hands the
//!   packet to a [`Savefile`],
//! * a [`StatsReporter`] samples capture statistics on its own thread.
//!
//! # Example
//!
//! ```no_run
//! use packetdump::{dump, CaptureConfig, LibpcapProvider, StopToken};
//!
//! let provider = LibpcapProvider::shared();
//! let config = CaptureConfig::builder("cap-%Y%m%d-%H%M%S.pcap")
//!     .interface("eth0")
//!     .rotate_seconds(3600)
//!     .build()
//!     .unwrap();
//! let stop = StopToken::new();
//! let summary = dump::run(&config, provider, &stop).unwrap();
//! println!("wrote {} packets", summary.packets);
//! ```

use std::{
    ffi::{self, CStr},
    io,
    path::PathBuf,
    str,
};

pub mod capture;
pub mod config;
pub mod device;
pub mod dump;
pub mod linktype;
pub mod packet;
#[cfg(unix)]
pub mod privilege;
mod raw;
pub mod rotation;
pub mod savefile;
pub mod stats;
pub mod stop;
pub mod template;

pub use capture::{
    offline::Offline, Capture, LibpcapProvider, Provider, Session, Stat, StatsSource,
};
pub use config::{CaptureConfig, ConfigBuilder};
pub use device::{Device, DeviceFlags, IfFlags};
pub use dump::DumpSummary;
pub use linktype::Linktype;
pub use packet::{Packet, PacketHeader};
pub use raw::Capability;
pub use rotation::Rotator;
pub use savefile::{Compression, FileSummary, Frame, Savefile, SavefileReader};
pub use stats::StatsReporter;
pub use stop::{StopRequest, StopToken};
pub use template::Calendar;

/// An error from the capture backend, the output files, or the run configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The capture library could not be loaded at all
    #[error("capture library unavailable: {0}")]
    LibraryUnavailable(String),
    /// The capture library was loaded but lacks this operation
    #[error("{0}: not supported by the capture library")]
    Unsupported(Capability),
    /// The interface could not be opened for capture
    #[error("{interface}: {message}")]
    CaptureUnavailable { interface: String, message: String },
    /// The capture library reported an error
    #[error("libpcap error: {0}")]
    PcapError(String),
    /// A hard error while waiting for the next packet
    #[error("read failure: {0}")]
    ReadFailure(String),
    /// The read timeout expired before a packet arrived
    #[error("timeout expired")]
    TimeoutExpired,
    /// A replay source has been read to the end
    #[error("no more packets to read from the file")]
    NoMorePackets,
    /// An output file could not be created
    #[error("{}: couldn't open file: {source}", path.display())]
    FileOpen { path: PathBuf, source: io::Error },
    /// A record could not be written to an output file
    #[error("{}: packet write failure: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    /// The LZ4 stream could not be encoded or decoded
    #[error("{}: lz4: {message}", path.display())]
    Compression { path: PathBuf, message: String },
    /// An input file is not a readable capture file
    #[error("{}: {message}", path.display())]
    Format { path: PathBuf, message: String },
    /// The configuration cannot describe a run
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Privileges could not be dropped
    #[error("relinquish privileges: {0}")]
    Privilege(String),
    /// The capture library returned a string that was not valid UTF-8
    #[error("libpcap returned invalid UTF-8: {0}")]
    MalformedError(#[from] str::Utf8Error),
    /// The capture library returned a null string
    #[error("libpcap returned a null string")]
    InvalidString,
    /// A string passed to the capture library contained an interior nul byte
    #[error("invalid input string (internal null)")]
    InvalidInputString,
}

impl From<ffi::NulError> for Error {
    fn from(_: ffi::NulError) -> Error {
        Error::InvalidInputString
    }
}

impl Error {
    /// Whether this error ends a capture run. Timeouts are the only recoverable outcome.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::TimeoutExpired)
    }

    /// Runs `func` with a zeroed libpcap error buffer.
    fn with_errbuf<T, F>(func: F) -> Result<T, Error>
    where
        F: FnOnce(*mut libc::c_char) -> Result<T, Error>,
    {
        let mut errbuf = [0i8; raw::PCAP_ERRBUF_SIZE];
        func(errbuf.as_mut_ptr() as _)
    }

    /// Builds a [`Error::PcapError`] from a C error string.
    unsafe fn new(ptr: *const libc::c_char) -> Error {
        match cstr_to_string(ptr) {
            Err(e) => e,
            Ok(string) => Error::PcapError(string.unwrap_or_default()),
        }
    }
}

/// Converts a C string to an owned Rust string, `None` for a null pointer.
unsafe fn cstr_to_string(ptr: *const libc::c_char) -> Result<Option<String>, Error> {
    let string = if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr as _).to_str()?.to_owned())
    };
    Ok(string)
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use super::*;

    #[test]
    fn test_cstr_to_string() {
        assert!(unsafe { cstr_to_string(std::ptr::null()) }.unwrap().is_none());

        let owned = CString::new("eth0").unwrap();
        let string = unsafe { cstr_to_string(owned.as_ptr()) }.unwrap();
        assert_eq!(string.as_deref(), Some("eth0"));
    }

    #[test]
    fn test_error_new() {
        let msg = CString::new("no such device").unwrap();
        let err = unsafe { Error::new(msg.as_ptr()) };
        assert!(matches!(err, Error::PcapError(ref s) if s == "no such device"));
    }

    #[test]
    fn test_errors_name_their_context() {
        let err = Error::Write {
            path: PathBuf::from("/tmp/cap.pcap"),
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        };
        assert_eq!(
            err.to_string(),
            "/tmp/cap.pcap: packet write failure: disk full"
        );

        let err = Error::CaptureUnavailable {
            interface: "eth9".to_string(),
            message: "No such device exists".to_string(),
        };
        assert_eq!(err.to_string(), "eth9: No such device exists");

        let err = Error::Unsupported(Capability::Stats);
        assert_eq!(err.to_string(), "pcap_stats: not supported by the capture library");
    }

    #[test]
    fn test_only_timeouts_are_recoverable() {
        assert!(!Error::TimeoutExpired.is_fatal());
        assert!(Error::NoMorePackets.is_fatal());
        assert!(Error::ReadFailure("device went down".into()).is_fatal());
    }

    #[test]
    fn test_nul_error() {
        let err: Error = CString::new("a\0b").unwrap_err().into();
        assert!(matches!(err, Error::InvalidInputString));
    }
}
