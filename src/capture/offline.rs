use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::{
    capture::{Session, Stat, StatsSource},
    linktype::Linktype,
    packet::Packet,
    raw::Capability,
    savefile::{Frame, SavefileReader},
    Error,
};

/// Replays existing capture files, plain or LZ4-compressed, as one session.
///
/// Files are read in the order given and must all share a link type. When the last file
/// is exhausted `next_packet` returns [`Error::NoMorePackets`].
pub struct Offline {
    name: String,
    pending: VecDeque<PathBuf>,
    reader: Option<SavefileReader>,
    linktype: Linktype,
    snaplen: u32,
    current: Option<Frame>,
    received: Arc<AtomicU32>,
}

impl Offline {
    /// Opens the first file to learn the link type. The rest are opened lazily.
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Offline, Error> {
        let mut pending: VecDeque<PathBuf> =
            paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        let first = pending
            .pop_front()
            .ok_or_else(|| Error::InvalidConfig("no files to read".to_string()))?;
        let reader = SavefileReader::open(&first)?;
        tracing::debug!(
            "replaying {} ({}, {:?})",
            first.display(),
            reader.linktype(),
            reader.compression()
        );
        Ok(Offline {
            name: first.display().to_string(),
            linktype: reader.linktype(),
            snaplen: reader.snaplen(),
            pending,
            reader: Some(reader),
            current: None,
            received: Arc::new(AtomicU32::new(0)),
        })
    }

    fn advance(&mut self) -> Result<Option<Frame>, Error> {
        loop {
            let reader = match self.reader.as_mut() {
                Some(reader) => reader,
                None => return Ok(None),
            };
            if let Some(frame) = reader.next_frame()? {
                return Ok(Some(frame));
            }
            self.reader = match self.pending.pop_front() {
                None => None,
                Some(path) => {
                    let reader = SavefileReader::open(&path)?;
                    if reader.linktype() != self.linktype {
                        return Err(Error::Format {
                            path,
                            message: format!(
                                "link type {} differs from {} in earlier files",
                                reader.linktype(),
                                self.linktype
                            ),
                        });
                    }
                    tracing::debug!("replaying {}", path.display());
                    self.name = path.display().to_string();
                    Some(reader)
                }
            };
        }
    }
}

impl Session for Offline {
    fn datalink(&self) -> Linktype {
        self.linktype
    }

    fn snaplen(&self) -> u32 {
        self.snaplen
    }

    fn next_packet(&mut self) -> Result<Packet<'_>, Error> {
        match self.advance()? {
            Some(frame) => {
                self.received.fetch_add(1, Ordering::Relaxed);
                Ok(self.current.insert(frame).as_packet())
            }
            None => {
                self.current = None;
                Err(Error::NoMorePackets)
            }
        }
    }

    fn filter(&mut self, _program: &str, _optimize: bool) -> Result<(), Error> {
        Err(Error::Unsupported(Capability::SetFilter))
    }

    fn stats_source(&self) -> Box<dyn StatsSource> {
        Box::new(OfflineStats {
            received: self.received.clone(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Frames replayed so far. A replay never drops.
struct OfflineStats {
    received: Arc<AtomicU32>,
}

impl StatsSource for OfflineStats {
    fn stats(&self) -> Result<Stat, Error> {
        Ok(Stat::new(self.received.load(Ordering::Relaxed), 0, 0))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::savefile::{Compression, Savefile};

    use super::*;

    fn write(dir: &TempDir, name: &str, linktype: Linktype, secs: &[i64]) -> PathBuf {
        let path = dir.path().join(name);
        let mut save =
            Savefile::create(&path, linktype, 65535, Compression::from_path(&path)).unwrap();
        for &sec in secs {
            save.write_frame(&[sec as u8; 20], 20, 20, sec, 0).unwrap();
        }
        save.close().unwrap();
        path
    }

    #[test]
    fn test_replay_across_files() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.pcap", Linktype::ETHERNET, &[1, 2]);
        let b = write(&dir, "b.pcap.lz4", Linktype::ETHERNET, &[]);
        let c = write(&dir, "c.pcap.lz4", Linktype::ETHERNET, &[3]);

        let mut offline = Offline::open(&[a, b, c]).unwrap();
        let stats = offline.stats_source();
        assert_eq!(offline.datalink(), Linktype::ETHERNET);

        let mut secs = vec![];
        loop {
            match offline.next_packet() {
                Ok(packet) => secs.push(packet.header.sec()),
                Err(Error::NoMorePackets) => break,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!(secs, vec![1, 2, 3]);
        assert!(offline.name().ends_with("c.pcap.lz4"));
        assert_eq!(stats.stats().unwrap(), Stat::new(3, 0, 0));
        // stays exhausted
        assert!(matches!(offline.next_packet(), Err(Error::NoMorePackets)));
    }

    #[test]
    fn test_mixed_linktypes_rejected() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.pcap", Linktype::ETHERNET, &[1]);
        let b = write(&dir, "b.pcap", Linktype::RAW, &[2]);

        let mut offline = Offline::open(&[a, b]).unwrap();
        assert!(offline.next_packet().is_ok());
        assert!(matches!(offline.next_packet(), Err(Error::Format { .. })));
    }

    #[test]
    fn test_no_files() {
        let paths: [PathBuf; 0] = [];
        assert!(matches!(
            Offline::open(&paths),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_filter_unsupported() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.pcap", Linktype::ETHERNET, &[1]);
        let mut offline = Offline::open(&[a]).unwrap();
        assert!(matches!(
            offline.filter("tcp port 80", true),
            Err(Error::Unsupported(Capability::SetFilter))
        ));
    }
}
