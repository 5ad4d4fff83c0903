use std::fmt;

use crate::{capture::Provider, Error};

/// This is a datalink link type, stored in the pcap file header of every output file.
///
/// As an example, `Linktype(1)` is ethernet. A full list of linktypes is available
/// [here](http://www.tcpdump.org/linktypes.html). The consts below are not exhaustive.
/// ```rust
/// use packetdump::Linktype;
///
/// let lt = Linktype(1);
/// assert_eq!(Linktype::ETHERNET, lt);
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct Linktype(pub i32);

impl Linktype {
    /// Gets the name of the link type, such as EN10MB, as reported by the capture library.
    pub fn get_name(&self, provider: &dyn Provider) -> Result<String, Error> {
        provider.datalink_name(*self)
    }

    /// Gets the description of the link type, such as "Ethernet", as reported by the
    /// capture library.
    pub fn get_description(&self, provider: &dyn Provider) -> Result<String, Error> {
        provider.datalink_description(*self)
    }

    /// Converts a `DLT_` value returned by a live handle into the `LINKTYPE_` value that
    /// belongs in a file header. The two only differ for a few platform-specific values.
    pub fn from_dlt(dlt: i32) -> Linktype {
        match dlt {
            // DLT_ATM_RFC1483
            11 => Linktype(100),
            // DLT_RAW, which is DLT_LOOP on OpenBSD
            12 if cfg!(not(target_os = "openbsd")) => Linktype::RAW,
            14 => Linktype::RAW,
            // DLT_SLIP_BSDOS, DLT_PPP_BSDOS
            15 => Linktype(102),
            16 => Linktype(103),
            // DLT_ATM_CLIP
            19 => Linktype(106),
            _ => Linktype(dlt),
        }
    }

    /// Name for the link types this crate knows without asking the capture library.
    pub fn known_name(&self) -> Option<&'static str> {
        let name = match *self {
            Linktype::NULL => "NULL",
            Linktype::ETHERNET => "EN10MB",
            Linktype::IEEE802_5 => "IEEE802",
            Linktype::PPP => "PPP",
            Linktype::RAW => "RAW",
            Linktype::IEEE802_11 => "IEEE802_11",
            Linktype::LOOP => "LOOP",
            Linktype::LINUX_SLL => "LINUX_SLL",
            Linktype::IEEE802_11_RADIOTAP => "IEEE802_11_RADIO",
            Linktype::IPV4 => "IPV4",
            Linktype::IPV6 => "IPV6",
            Linktype::LINUX_SLL2 => "LINUX_SLL2",
            _ => return None,
        };
        Some(name)
    }

    pub const NULL: Self = Self(0);
    pub const ETHERNET: Self = Self(1);
    pub const IEEE802_5: Self = Self(6);
    pub const PPP: Self = Self(9);
    pub const RAW: Self = Self(101);
    pub const IEEE802_11: Self = Self(105);
    pub const LOOP: Self = Self(108);
    pub const LINUX_SLL: Self = Self(113);
    pub const IEEE802_11_RADIOTAP: Self = Self(127);
    pub const IPV4: Self = Self(228);
    pub const IPV6: Self = Self(229);
    pub const LINUX_SLL2: Self = Self(276);
}

impl fmt::Display for Linktype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.known_name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::capture::MockProvider;

    use super::*;

    #[test]
    fn test_get_name() {
        let mut provider = MockProvider::new();
        provider
            .expect_datalink_name()
            .withf(|lt| *lt == Linktype::ETHERNET)
            .return_once(|_| Ok("EN10MB".to_string()));

        assert_eq!(Linktype::ETHERNET.get_name(&provider).unwrap(), "EN10MB");
    }

    #[test]
    fn test_get_name_unsupported() {
        let mut provider = MockProvider::new();
        provider
            .expect_datalink_name()
            .return_once(|_| Err(Error::Unsupported(crate::Capability::DatalinkName)));

        assert!(Linktype(147).get_name(&provider).is_err());
    }

    #[test]
    fn test_get_description() {
        let mut provider = MockProvider::new();
        provider
            .expect_datalink_description()
            .withf(|lt| *lt == Linktype::ETHERNET)
            .return_once(|_| Ok("Ethernet".to_string()));

        assert_eq!(
            Linktype::ETHERNET.get_description(&provider).unwrap(),
            "Ethernet"
        );
    }

    #[test]
    fn test_from_dlt() {
        assert_eq!(Linktype::from_dlt(1), Linktype::ETHERNET);
        assert_eq!(Linktype::from_dlt(14), Linktype::RAW);
        assert_eq!(Linktype::from_dlt(101), Linktype::RAW);
        assert_eq!(Linktype::from_dlt(113), Linktype::LINUX_SLL);
        #[cfg(target_os = "linux")]
        assert_eq!(Linktype::from_dlt(12), Linktype::RAW);
    }

    #[test]
    fn test_display() {
        assert_eq!(Linktype::ETHERNET.to_string(), "EN10MB (1)");
        assert_eq!(Linktype(147).to_string(), "147");
        assert_eq!(Linktype::LINUX_SLL.known_name(), Some("LINUX_SLL"));
    }
}
