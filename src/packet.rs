use std::{fmt, ops::Deref};

/// One captured frame, borrowed from the session that produced it.
///
/// A `Packet` only lives for one processing step: the session may reuse the underlying
/// buffer as soon as the next packet is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet<'a> {
    /// The packet header provided by the capture backend, including the timeval, captured
    /// length, and packet length
    pub header: &'a PacketHeader,
    /// The captured packet data
    pub data: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn new(header: &'a PacketHeader, data: &'a [u8]) -> Packet<'a> {
        Packet { header, data }
    }
}

impl Deref for Packet<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
/// Represents a packet header provided by pcap, including the timeval, caplen and len.
///
/// The layout matches `struct pcap_pkthdr` so that headers handed out by libpcap can be
/// borrowed without copying.
pub struct PacketHeader {
    /// The time when the packet was captured
    pub ts: libc::timeval,
    /// The number of bytes of the packet that are available from the capture
    pub caplen: u32,
    /// The length of the packet, in bytes (which might be more than the number of bytes available
    /// from the capture, if the length of the packet is larger than the maximum number of bytes to
    /// capture)
    pub len: u32,
}

impl PacketHeader {
    pub fn new(sec: i64, usec: i64, caplen: u32, len: u32) -> PacketHeader {
        PacketHeader {
            ts: libc::timeval {
                tv_sec: sec as _,
                tv_usec: usec as _,
            },
            caplen,
            len,
        }
    }

    /// Capture time, whole seconds since the epoch.
    pub fn sec(&self) -> i64 {
        self.ts.tv_sec as i64
    }

    /// Capture time, microseconds within the second.
    pub fn usec(&self) -> i64 {
        self.ts.tv_usec as i64
    }
}

impl fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PacketHeader {{ ts: {}.{:06}, caplen: {}, len: {} }}",
            self.ts.tv_sec, self.ts.tv_usec, self.caplen, self.len
        )
    }
}

impl PartialEq for PacketHeader {
    fn eq(&self, rhs: &PacketHeader) -> bool {
        self.ts.tv_sec == rhs.ts.tv_sec
            && self.ts.tv_usec == rhs.ts.tv_usec
            && self.caplen == rhs.caplen
            && self.len == rhs.len
    }
}

impl Eq for PacketHeader {}

#[cfg(test)]
mod tests {
    use crate::raw;

    use super::*;

    static HEADER: PacketHeader = PacketHeader {
        ts: libc::timeval {
            tv_sec: 5,
            tv_usec: 50,
        },
        caplen: 5,
        len: 9,
    };

    #[test]
    fn test_packet_header_size() {
        use std::mem::size_of;
        assert_eq!(size_of::<PacketHeader>(), size_of::<raw::pcap_pkthdr>());
    }

    #[test]
    fn test_packet_header_accessors() {
        let header = PacketHeader::new(1614834367, 123456, 60, 1514);
        assert_eq!(header.sec(), 1614834367);
        assert_eq!(header.usec(), 123456);
        assert_eq!(header.caplen, 60);
        assert_eq!(header.len, 1514);
        assert_ne!(header, HEADER);
    }

    #[test]
    fn test_packet_header_display() {
        assert_eq!(
            format!("{HEADER:?}"),
            "PacketHeader { ts: 5.000050, caplen: 5, len: 9 }"
        );
    }

    #[test]
    fn test_packet_deref() {
        let data = [1u8, 2, 3, 4, 5];
        let packet = Packet::new(&HEADER, &data);
        assert_eq!(packet.len(), 5);
        assert_eq!(&packet[..2], &[1, 2]);
    }
}
