use std::{convert::TryFrom, fmt};

use bitflags::bitflags;

use crate::{capture::Provider, cstr_to_string, raw, Error};

bitflags! {
    /// Network device flags.
    pub struct IfFlags: u32 {
        /// Set if the device is a loopback interface
        const LOOPBACK = raw::PCAP_IF_LOOPBACK;
        /// Set if the device is up
        const UP = raw::PCAP_IF_UP;
        /// Set if the device is running
        const RUNNING = raw::PCAP_IF_RUNNING;
        /// Set if the device is a wireless interface; this includes IrDA as well as radio-based
        /// networks such as IEEE 802.15.4 and IEEE 802.11, so it doesn't just mean Wi-Fi
        const WIRELESS = raw::PCAP_IF_WIRELESS;
    }
}

impl From<u32> for IfFlags {
    fn from(flags: u32) -> Self {
        IfFlags::from_bits_truncate(flags)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFlags {
    pub if_flags: IfFlags,
}

impl From<u32> for DeviceFlags {
    fn from(flags: u32) -> Self {
        DeviceFlags {
            if_flags: flags.into(),
        }
    }
}

impl DeviceFlags {
    pub fn empty() -> Self {
        DeviceFlags {
            if_flags: IfFlags::empty(),
        }
    }

    pub fn contains(&self, if_flags: IfFlags) -> bool {
        self.if_flags.contains(if_flags)
    }

    pub fn is_loopback(&self) -> bool {
        self.contains(IfFlags::LOOPBACK)
    }

    pub fn is_up(&self) -> bool {
        self.contains(IfFlags::UP)
    }

    pub fn is_running(&self) -> bool {
        self.contains(IfFlags::RUNNING)
    }

    pub fn is_wireless(&self) -> bool {
        self.contains(IfFlags::WIRELESS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A network device name and the capture library's description of it.
pub struct Device {
    /// The name of the interface
    pub name: String,
    /// A textual description of the interface, if available
    pub desc: Option<String>,
    /// Interface flags
    pub flags: DeviceFlags,
}

impl Device {
    pub fn new(name: String, desc: Option<String>, flags: DeviceFlags) -> Device {
        Device { name, desc, flags }
    }

    /// Returns the default device suitable for captures: the first one the provider
    /// enumerates. `Ok(None)` means the platform reported no devices at all.
    pub fn lookup(provider: &dyn Provider) -> Result<Option<Device>, Error> {
        Ok(provider.devices()?.into_iter().next())
    }

    /// Returns every device the provider knows about.
    pub fn list(provider: &dyn Provider) -> Result<Vec<Device>, Error> {
        provider.devices()
    }
}

impl From<&str> for Device {
    fn from(name: &str) -> Self {
        Device::new(name.into(), None, DeviceFlags::empty())
    }
}

impl TryFrom<&raw::pcap_if_t> for Device {
    type Error = Error;

    fn try_from(dev: &raw::pcap_if_t) -> Result<Self, Error> {
        Ok(Device::new(
            unsafe { cstr_to_string(dev.name)?.ok_or(Error::InvalidString)? },
            unsafe { cstr_to_string(dev.description)? },
            DeviceFlags::from(dev.flags),
        ))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \t", self.name)?;
        match &self.desc {
            Some(desc) => write!(f, "({})", desc)?,
            None => write!(f, "(No description available)")?,
        }
        let mut states = Vec::new();
        if self.flags.is_up() {
            states.push("up");
        }
        if self.flags.is_running() {
            states.push("running");
        }
        if self.flags.is_loopback() {
            states.push("loopback");
        }
        if self.flags.is_wireless() {
            states.push("wireless");
        }
        if !states.is_empty() {
            write!(f, " [{}]", states.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{ffi::CString, ptr};

    use crate::capture::MockProvider;

    use super::*;

    fn devices() -> Vec<Device> {
        vec![
            Device::new(
                "eth0".to_string(),
                None,
                DeviceFlags::from(raw::PCAP_IF_UP | raw::PCAP_IF_RUNNING),
            ),
            Device::new(
                "lo".to_string(),
                Some("Loopback device".to_string()),
                DeviceFlags::from(raw::PCAP_IF_LOOPBACK | raw::PCAP_IF_UP),
            ),
        ]
    }

    #[test]
    fn test_lookup_first() {
        let mut provider = MockProvider::new();
        provider.expect_devices().return_once(|| Ok(devices()));

        let device = Device::lookup(&provider).unwrap().unwrap();
        assert_eq!(device.name, "eth0");
    }

    #[test]
    fn test_lookup_none_is_not_an_error() {
        let mut provider = MockProvider::new();
        provider.expect_devices().return_once(|| Ok(vec![]));

        assert!(Device::lookup(&provider).unwrap().is_none());
    }

    #[test]
    fn test_list_error() {
        let mut provider = MockProvider::new();
        provider
            .expect_devices()
            .return_once(|| Err(Error::PcapError("permission denied".to_string())));

        assert!(Device::list(&provider).is_err());
    }

    #[test]
    fn test_device_flags() {
        let flags = DeviceFlags::from(raw::PCAP_IF_LOOPBACK | raw::PCAP_IF_UP | 0x8000_0000);
        assert!(flags.is_loopback());
        assert!(flags.is_up());
        assert!(!flags.is_running());
        assert!(!flags.is_wireless());
        assert!(!DeviceFlags::empty().is_up());
    }

    #[test]
    fn test_try_from_pcap_if() {
        let name = CString::new("wlan0").unwrap();
        let desc = CString::new("Wireless").unwrap();
        let dev = raw::pcap_if_t {
            next: ptr::null_mut(),
            name: name.as_ptr() as _,
            description: desc.as_ptr() as _,
            addresses: ptr::null_mut(),
            flags: raw::PCAP_IF_WIRELESS,
        };
        let device = Device::try_from(&dev).unwrap();
        assert_eq!(device.name, "wlan0");
        assert_eq!(device.desc.as_deref(), Some("Wireless"));
        assert!(device.flags.is_wireless());

        let dev = raw::pcap_if_t {
            name: ptr::null_mut(),
            ..dev
        };
        assert!(matches!(Device::try_from(&dev), Err(Error::InvalidString)));
    }

    #[test]
    fn test_display() {
        let list = devices();
        assert_eq!(list[0].to_string(), "eth0 \t(No description available) [up, running]");
        assert_eq!(list[1].to_string(), "lo \t(Loopback device) [up, loopback]");
        assert_eq!(Device::from("any").to_string(), "any \t(No description available)");
    }
}
