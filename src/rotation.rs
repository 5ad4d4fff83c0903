use std::{
    collections::VecDeque,
    fs, io,
    path::{Path, PathBuf},
};

use crate::{
    config::CaptureConfig,
    linktype::Linktype,
    packet::Packet,
    savefile::{Compression, Savefile},
    template::{self, Calendar},
    Error,
};

/// The first timestamp at or after which a file opened at `sec` must rotate: the end of
/// the `period`-second window, aligned to the epoch, that contains `sec`. `None` when time
/// rotation is disabled.
///
/// ```rust
/// use packetdump::rotation::next_rotate_time;
///
/// assert_eq!(next_rotate_time(3_725, 3_600), Some(7_200));
/// assert_eq!(next_rotate_time(3_600, 3_600), Some(7_200));
/// assert_eq!(next_rotate_time(3_725, 0), None);
/// ```
pub fn next_rotate_time(sec: i64, period: u64) -> Option<i64> {
    if period == 0 {
        return None;
    }
    let period = i64::try_from(period).unwrap_or(i64::MAX);
    Some((sec - sec.rem_euclid(period)).saturating_add(period))
}

struct OpenFile {
    savefile: Savefile,
    bytes: u64,
    packets: u64,
    deadline: Option<i64>,
}

/// Owns the current output file and decides, per packet, when to start the next one.
///
/// A packet that triggers a rotation is written to the new file only.
pub struct Rotator {
    pattern: String,
    calendar: Calendar,
    compression: Compression,
    rotate_bytes: u64,
    rotate_seconds: u64,
    max_files: usize,
    linktype: Linktype,
    snaplen: u32,
    current: Option<OpenFile>,
    created: VecDeque<PathBuf>,
    files_opened: u64,
    packets: u64,
    bytes: u64,
}

impl Rotator {
    pub fn new(config: &CaptureConfig, linktype: Linktype, snaplen: u32) -> Rotator {
        let rotates = config.rotate_bytes > 0 || config.rotate_seconds > 0;
        if rotates && !template::has_placeholders(&config.pattern) {
            tracing::warn!(
                "{}: no time placeholders, each rotation overwrites the previous file",
                config.pattern
            );
        }
        Rotator {
            pattern: config.pattern.clone(),
            calendar: config.calendar,
            compression: config.compression,
            rotate_bytes: config.rotate_bytes,
            rotate_seconds: config.rotate_seconds,
            max_files: config.max_files,
            linktype,
            snaplen,
            current: None,
            created: VecDeque::new(),
            files_opened: 0,
            packets: 0,
            bytes: 0,
        }
    }

    /// Writes `packet`, first rotating or opening a file as needed.
    pub fn write(&mut self, packet: &Packet<'_>) -> Result<(), Error> {
        let sec = packet.header.sec();
        let mut file = match self.current.take() {
            Some(file) if self.should_rotate(&file, sec, packet.header.caplen) => {
                tracing::debug!(
                    "rotating {} after {} packets, {} bytes",
                    file.savefile.path().display(),
                    file.packets,
                    file.bytes
                );
                self.finish(file)?;
                self.open(sec)?
            }
            Some(file) => file,
            None => self.open(sec)?,
        };
        let result = file.savefile.write(packet);
        if let Ok(written) = result {
            file.bytes += written;
            file.packets += 1;
            self.bytes += written;
            self.packets += 1;
            tracing::trace!("{:?} -> {} bytes", packet.header, written);
        }
        self.current = Some(file);
        result.map(|_| ())
    }

    /// Closes the current file, if any.
    pub fn close(&mut self) -> Result<(), Error> {
        match self.current.take() {
            Some(file) => self.finish(file),
            None => Ok(()),
        }
    }

    /// Path of the file currently being written.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|file| file.savefile.path())
    }

    /// Files this run created and has not deleted, oldest first.
    pub fn retained(&self) -> impl Iterator<Item = &Path> {
        self.created.iter().map(PathBuf::as_path)
    }

    pub fn files_opened(&self) -> u64 {
        self.files_opened
    }

    /// Packets written across all files.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Bytes committed across all files, excluding file headers and LZ4 data still
    /// buffered in an open file.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn should_rotate(&self, file: &OpenFile, sec: i64, caplen: u32) -> bool {
        if self.rotate_bytes > 0 {
            if file.bytes >= self.rotate_bytes {
                return true;
            }
            // an uncompressed record's size is known up front, so don't let it overshoot
            if file.packets > 0 {
                if let Some(len) = file.savefile.record_len(caplen) {
                    if file.bytes + len > self.rotate_bytes {
                        return true;
                    }
                }
            }
        }
        matches!(file.deadline, Some(deadline) if sec >= deadline)
    }

    fn open(&mut self, sec: i64) -> Result<OpenFile, Error> {
        let path = PathBuf::from(template::expand(&self.pattern, sec, self.calendar));
        let savefile = Savefile::create(&path, self.linktype, self.snaplen, self.compression)?;
        self.files_opened += 1;
        tracing::info!("opened {}", path.display());

        // a pattern without placeholders reuses one path; track it once
        self.created.retain(|p| *p != path);
        self.created.push_back(path);
        self.enforce_retention();

        Ok(OpenFile {
            savefile,
            bytes: 0,
            packets: 0,
            deadline: next_rotate_time(sec, self.rotate_seconds),
        })
    }

    fn finish(&mut self, file: OpenFile) -> Result<(), Error> {
        let path = file.savefile.path().to_path_buf();
        let size = file.savefile.close()?;
        tracing::info!(
            "closed {} ({} packets, {} bytes)",
            path.display(),
            file.packets,
            size
        );
        Ok(())
    }

    fn enforce_retention(&mut self) {
        if self.max_files == 0 {
            return;
        }
        while self.created.len() > self.max_files {
            let oldest = match self.created.pop_front() {
                Some(oldest) => oldest,
                None => break,
            };
            match fs::remove_file(&oldest) {
                Ok(()) => tracing::info!("removed {}", oldest.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!("{} already gone", oldest.display())
                }
                Err(e) => tracing::warn!("{}: couldn't remove: {}", oldest.display(), e),
            }
        }
    }
}

impl Drop for Rotator {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("{}", e);
        }
    }
}
