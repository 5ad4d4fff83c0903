use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    capture::{Capture, DEFAULT_SNAPLEN, DEFAULT_TIMEOUT_MS},
    device::Device,
    savefile::Compression,
    template::Calendar,
    Error,
};

pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(100);

/// Everything a capture run needs to know, fixed for the duration of the run.
///
/// Built with [`CaptureConfig::builder`], which validates the combination of settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Interface to capture on. `None` picks the first device the provider lists.
    pub interface: Option<String>,
    /// Output filename pattern, see [`crate::template`]
    pub pattern: String,
    /// Rotate once a file holds this many bytes. 0 disables size rotation.
    pub rotate_bytes: u64,
    /// Rotate on multiples of this many seconds since the epoch. 0 disables time rotation.
    pub rotate_seconds: u64,
    /// Keep at most this many files from this run. 0 keeps everything.
    pub max_files: usize,
    pub compression: Compression,
    /// Calendar used to expand the filename pattern
    pub calendar: Calendar,
    pub snaplen: i32,
    pub promisc: bool,
    pub monitor_mode: bool,
    /// Read timeout in milliseconds
    pub timeout_ms: i32,
    /// Inline BPF filter expression
    pub bpf: Option<String>,
    /// File holding a BPF filter expression
    pub bpf_file: Option<PathBuf>,
    /// Capture files to replay instead of capturing live
    pub read_files: Vec<PathBuf>,
    /// User to switch to once the capture is open
    pub drop_user: Option<String>,
    pub stats_interval: Duration,
    /// Print `packets=N, drops=M` to stderr while capturing
    pub status_line: bool,
}

impl CaptureConfig {
    pub fn builder<S: Into<String>>(pattern: S) -> ConfigBuilder {
        ConfigBuilder::new(pattern)
    }

    /// Whether packets come from files rather than an interface.
    pub fn is_replay(&self) -> bool {
        !self.read_files.is_empty()
    }

    /// The filter expression to install, read from `bpf_file` if that is where it lives.
    pub fn filter_program(&self) -> Result<Option<String>, Error> {
        if let Some(bpf) = &self.bpf {
            return Ok(Some(bpf.clone()));
        }
        match &self.bpf_file {
            None => Ok(None),
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| Error::FileOpen {
                    path: path.clone(),
                    source,
                })?;
                let program = strip_comments(&text);
                Ok((!program.is_empty()).then_some(program))
            }
        }
    }

    /// Live capture parameters for `device`.
    pub fn capture(&self, device: Device) -> Capture {
        Capture::from_device(device)
            .snaplen(self.snaplen)
            .promisc(self.promisc)
            .timeout(self.timeout_ms)
            .rfmon(self.monitor_mode)
    }
}

/// Renders the configuration in `name = value` form, one option per line.
impl fmt::Display for CaptureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt<T: fmt::Display>(value: &Option<T>) -> String {
            value.as_ref().map(|v| v.to_string()).unwrap_or_default()
        }

        writeln!(f, "filesize = {}", self.rotate_bytes)?;
        writeln!(f, "filetime = {}", self.rotate_seconds)?;
        writeln!(f, "maxfiles = {}", self.max_files)?;
        writeln!(f, "interface = {}", opt(&self.interface))?;
        writeln!(f, "writefile = {}", self.pattern)?;
        writeln!(f, "bpf = {}", opt(&self.bpf))?;
        writeln!(
            f,
            "bpf-file = {}",
            opt(&self.bpf_file.as_ref().map(|p| p.display()))
        )?;
        writeln!(f, "compress = {}", self.compression.is_compressed())?;
        writeln!(f, "gmt = {}", self.calendar == Calendar::Utc)?;
        writeln!(f, "monitor-mode = {}", self.monitor_mode)?;
        writeln!(f, "no-promiscuous-mode = {}", !self.promisc)?;
        writeln!(f, "relinquish-privileges = {}", opt(&self.drop_user))?;
        for path in &self.read_files {
            writeln!(f, "readfile = {}", path.display())?;
        }
        Ok(())
    }
}

/// Builder for [`CaptureConfig`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: CaptureConfig,
    compress: bool,
}

impl ConfigBuilder {
    fn new<S: Into<String>>(pattern: S) -> ConfigBuilder {
        ConfigBuilder {
            config: CaptureConfig {
                interface: None,
                pattern: pattern.into(),
                rotate_bytes: 0,
                rotate_seconds: 0,
                max_files: 0,
                compression: Compression::None,
                calendar: Calendar::Local,
                snaplen: DEFAULT_SNAPLEN,
                promisc: true,
                monitor_mode: false,
                timeout_ms: DEFAULT_TIMEOUT_MS,
                bpf: None,
                bpf_file: None,
                read_files: Vec::new(),
                drop_user: None,
                stats_interval: DEFAULT_STATS_INTERVAL,
                status_line: false,
            },
            compress: false,
        }
    }

    pub fn interface<S: Into<String>>(mut self, name: S) -> ConfigBuilder {
        self.config.interface = Some(name.into());
        self
    }

    pub fn rotate_bytes(mut self, bytes: u64) -> ConfigBuilder {
        self.config.rotate_bytes = bytes;
        self
    }

    pub fn rotate_seconds(mut self, seconds: u64) -> ConfigBuilder {
        self.config.rotate_seconds = seconds;
        self
    }

    pub fn max_files(mut self, count: usize) -> ConfigBuilder {
        self.config.max_files = count;
        self
    }

    /// Forces LZ4 compression. A pattern ending in `.lz4` enables it regardless.
    pub fn compress(mut self, to: bool) -> ConfigBuilder {
        self.compress = to;
        self
    }

    /// Expand filename placeholders in UTC instead of local time.
    pub fn utc(mut self, to: bool) -> ConfigBuilder {
        self.config.calendar = if to { Calendar::Utc } else { Calendar::Local };
        self
    }

    pub fn snaplen(mut self, snaplen: i32) -> ConfigBuilder {
        self.config.snaplen = snaplen;
        self
    }

    pub fn promisc(mut self, to: bool) -> ConfigBuilder {
        self.config.promisc = to;
        self
    }

    pub fn monitor_mode(mut self, to: bool) -> ConfigBuilder {
        self.config.monitor_mode = to;
        self
    }

    pub fn timeout_ms(mut self, ms: i32) -> ConfigBuilder {
        self.config.timeout_ms = ms;
        self
    }

    pub fn bpf<S: Into<String>>(mut self, program: S) -> ConfigBuilder {
        self.config.bpf = Some(program.into());
        self
    }

    pub fn bpf_file<P: AsRef<Path>>(mut self, path: P) -> ConfigBuilder {
        self.config.bpf_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_file<P: AsRef<Path>>(mut self, path: P) -> ConfigBuilder {
        self.config.read_files.push(path.as_ref().to_path_buf());
        self
    }

    pub fn drop_user<S: Into<String>>(mut self, user: S) -> ConfigBuilder {
        self.config.drop_user = Some(user.into());
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> ConfigBuilder {
        self.config.stats_interval = interval;
        self
    }

    pub fn status_line(mut self, to: bool) -> ConfigBuilder {
        self.config.status_line = to;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<CaptureConfig, Error> {
        let mut config = self.config;
        if config.pattern.is_empty() {
            return Err(Error::InvalidConfig("no output file given".to_string()));
        }
        if config.snaplen <= 0 {
            return Err(Error::InvalidConfig(format!(
                "snapshot length {} must be positive",
                config.snaplen
            )));
        }
        if config.timeout_ms < 0 {
            return Err(Error::InvalidConfig(format!(
                "read timeout {} ms must not be negative",
                config.timeout_ms
            )));
        }
        if config.bpf.is_some() && config.bpf_file.is_some() {
            return Err(Error::InvalidConfig(
                "give the filter inline or in a file, not both".to_string(),
            ));
        }
        if config.interface.is_some() && !config.read_files.is_empty() {
            return Err(Error::InvalidConfig(
                "capture from an interface or read files, not both".to_string(),
            ));
        }
        if config.stats_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "statistics interval must not be zero".to_string(),
            ));
        }
        config.compression = if self.compress {
            Compression::Lz4
        } else {
            Compression::from_path(&config.pattern)
        };
        Ok(config)
    }
}

/// Parses a byte count with an optional `k`, `m` or `g` suffix (powers of 1000). `0x`
/// prefixed hexadecimal is accepted too.
pub fn parse_size(text: &str) -> Result<u64, Error> {
    let invalid = || Error::InvalidConfig(format!("{}: not a size", text));
    let text = text.trim();
    let (digits, multiplier) = match text.char_indices().last() {
        Some((i, 'k' | 'K')) => (&text[..i], 1_000),
        Some((i, 'm' | 'M')) => (&text[..i], 1_000_000),
        Some((i, 'g' | 'G')) => (&text[..i], 1_000_000_000),
        Some(_) => (text, 1),
        None => return Err(invalid()),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
    .map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

fn strip_comments(text: &str) -> String {
    text.lines()
        .map(|line| match line.find('#') {
            Some(i) => &line[..i],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = CaptureConfig::builder("cap.pcap").build().unwrap();
        assert_eq!(config.snaplen, 65536);
        assert_eq!(config.timeout_ms, 10);
        assert!(config.promisc);
        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.calendar, Calendar::Local);
        assert_eq!(config.stats_interval, Duration::from_millis(100));
        assert!(!config.is_replay());
    }

    #[test]
    fn test_lz4_suffix_enables_compression() {
        let config = CaptureConfig::builder("cap-%H.pcap.lz4").build().unwrap();
        assert_eq!(config.compression, Compression::Lz4);

        // compress(false) doesn't override the suffix
        let config = CaptureConfig::builder("cap.lz4")
            .compress(false)
            .build()
            .unwrap();
        assert_eq!(config.compression, Compression::Lz4);

        let config = CaptureConfig::builder("cap.pcap")
            .compress(true)
            .build()
            .unwrap();
        assert_eq!(config.compression, Compression::Lz4);
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            CaptureConfig::builder("").interface("eth0").build(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(CaptureConfig::builder("a.pcap").snaplen(0).build().is_err());
        assert!(CaptureConfig::builder("a.pcap").timeout_ms(-1).build().is_err());
        assert!(CaptureConfig::builder("a.pcap")
            .bpf("tcp")
            .bpf_file("/etc/filter")
            .build()
            .is_err());
        assert!(CaptureConfig::builder("a.pcap")
            .interface("eth0")
            .read_file("old.pcap")
            .build()
            .is_err());
        assert!(CaptureConfig::builder("a.pcap")
            .stats_interval(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_echo() {
        let config = CaptureConfig::builder("cap-%Y.pcap.lz4")
            .interface("eth0")
            .rotate_bytes(1_000_000)
            .rotate_seconds(3600)
            .max_files(24)
            .utc(true)
            .promisc(false)
            .bpf("tcp port 80")
            .build()
            .unwrap();
        assert_eq!(
            config.to_string(),
            "filesize = 1000000\n\
             filetime = 3600\n\
             maxfiles = 24\n\
             interface = eth0\n\
             writefile = cap-%Y.pcap.lz4\n\
             bpf = tcp port 80\n\
             bpf-file = \n\
             compress = true\n\
             gmt = true\n\
             monitor-mode = false\n\
             no-promiscuous-mode = true\n\
             relinquish-privileges = \n"
        );
    }

    #[test]
    fn test_filter_program_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# web traffic only").unwrap();
        writeln!(file, "tcp port 80   # http").unwrap();
        writeln!(file, "  or tcp port 443").unwrap();

        let config = CaptureConfig::builder("a.pcap")
            .bpf_file(file.path())
            .build()
            .unwrap();
        assert_eq!(
            config.filter_program().unwrap().as_deref(),
            Some("tcp port 80 or tcp port 443")
        );

        let config = CaptureConfig::builder("a.pcap").build().unwrap();
        assert_eq!(config.filter_program().unwrap(), None);
    }

    #[test]
    fn test_filter_file_missing() {
        let config = CaptureConfig::builder("a.pcap")
            .bpf_file("/nonexistent/filter.bpf")
            .build()
            .unwrap();
        assert!(matches!(
            config.filter_program(),
            Err(Error::FileOpen { .. })
        ));
    }

    #[test]
    fn test_capture_parameters() {
        let config = CaptureConfig::builder("a.pcap")
            .snaplen(128)
            .monitor_mode(true)
            .build()
            .unwrap();
        let capture = config.capture(Device::from("wlan0"));
        assert_eq!(capture.get_snaplen(), 128);
        assert!(capture.is_rfmon());
        assert!(capture.is_promisc());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1000").unwrap(), 1000);
        assert_eq!(parse_size("10k").unwrap(), 10_000);
        assert_eq!(parse_size("5M").unwrap(), 5_000_000);
        assert_eq!(parse_size("2g").unwrap(), 2_000_000_000);
        assert_eq!(parse_size("0x10").unwrap(), 16);
        assert!(parse_size("").is_err());
        assert!(parse_size("k").is_err());
        assert!(parse_size("ten").is_err());
        assert!(parse_size("99999999999999999999g").is_err());
    }
}
