//! Reading and writing pcap savefiles, optionally wrapped in one LZ4 frame.
//!
//! The on-disk layout is the classic libpcap format, written little-endian with
//! microsecond timestamps:
//!
//! ```text
//! file header   magic(4) major(2) minor(2) thiszone(4) sigfigs(4) snaplen(4) network(4)
//! record        ts_sec(4) ts_usec(4) incl_len(4) orig_len(4) data(incl_len)
//! ```
//!
//! With [`Compression::Lz4`] the whole byte stream above, header included, is fed through
//! a single streaming LZ4 frame encoder that is opened with the file and finished when
//! the file is closed.

mod reader;

pub use reader::{FileSummary, Frame, SavefileReader};

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use lz4_flex::frame::FrameEncoder;

use crate::{linktype::Linktype, packet::Packet, Error};

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;
pub const FILE_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;
pub const LZ4_FRAME_MAGIC: u32 = 0x184d_2204;

/// How records are stored in an output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Plain pcap
    #[default]
    None,
    /// One LZ4 frame spanning the whole file
    Lz4,
}

impl Compression {
    /// Infers compression from the file name: a `.lz4` suffix selects LZ4.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Compression {
        let is_lz4 = path
            .as_ref()
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("lz4"));
        if is_lz4 {
            Compression::Lz4
        } else {
            Compression::None
        }
    }

    pub fn is_compressed(self) -> bool {
        self != Compression::None
    }
}

/// Counts the bytes that pass through to the file.
struct Counter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for Counter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Stream {
    Plain(Counter<BufWriter<File>>),
    Lz4(FrameEncoder<Counter<BufWriter<File>>>),
}

impl Stream {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Stream::Plain(w) => w.write_all(buf),
            Stream::Lz4(w) => w.write_all(buf),
        }
    }

    fn committed(&self) -> u64 {
        match self {
            Stream::Plain(w) => w.count,
            Stream::Lz4(w) => w.get_ref().count,
        }
    }
}

/// A pcap file open for writing.
///
/// Dropping a `Savefile` without calling [`Savefile::close`] still flushes it and
/// terminates the LZ4 stream, so an interrupted run leaves a readable file behind.
pub struct Savefile {
    path: PathBuf,
    linktype: Linktype,
    compression: Compression,
    stream: Option<Stream>,
    packets: u64,
}

impl Savefile {
    /// Creates (or truncates) `path` and writes the pcap file header.
    pub fn create<P: AsRef<Path>>(
        path: P,
        linktype: Linktype,
        snaplen: u32,
        compression: Compression,
    ) -> Result<Savefile, Error> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| Error::FileOpen {
            path: path.clone(),
            source,
        })?;
        let counter = Counter {
            inner: BufWriter::new(file),
            count: 0,
        };
        let stream = match compression {
            Compression::None => Stream::Plain(counter),
            Compression::Lz4 => Stream::Lz4(FrameEncoder::new(counter)),
        };
        let mut savefile = Savefile {
            path,
            linktype,
            compression,
            stream: Some(stream),
            packets: 0,
        };
        savefile.write_bytes(&file_header(linktype, snaplen))?;
        Ok(savefile)
    }

    /// Appends a captured packet. See [`Savefile::write_frame`].
    pub fn write(&mut self, packet: &Packet<'_>) -> Result<u64, Error> {
        self.write_frame(
            packet.data,
            packet.header.caplen,
            packet.header.len,
            packet.header.sec(),
            packet.header.usec(),
        )
    }

    /// Appends one record and returns the number of bytes that reached the file for it.
    ///
    /// Under compression the count is whatever the encoder emitted while consuming this
    /// record, which is usually less than `caplen` and may be zero while the encoder
    /// fills a block.
    pub fn write_frame(
        &mut self,
        data: &[u8],
        caplen: u32,
        len: u32,
        sec: i64,
        usec: i64,
    ) -> Result<u64, Error> {
        let data = match data.get(..caplen as usize) {
            Some(data) => data,
            None => {
                return Err(Error::Write {
                    path: self.path.clone(),
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("captured length {} exceeds {} buffered bytes", caplen, data.len()),
                    ),
                })
            }
        };
        let before = self.bytes_written();
        self.write_bytes(&record_header(sec, usec, caplen, len))?;
        self.write_bytes(data)?;
        self.packets += 1;
        Ok(self.bytes_written() - before)
    }

    /// Bytes that have reached the file so far, after compression.
    pub fn bytes_written(&self) -> u64 {
        self.stream.as_ref().map_or(0, Stream::committed)
    }

    /// The exact number of bytes a record of `caplen` bytes will add to the file, when
    /// that is knowable in advance (it isn't under compression).
    pub fn record_len(&self, caplen: u32) -> Option<u64> {
        match self.compression {
            Compression::None => Some(RECORD_HEADER_LEN as u64 + caplen as u64),
            Compression::Lz4 => None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn linktype(&self) -> Linktype {
        self.linktype
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Number of records written.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Flushes and finalizes the file, returning its final size in bytes.
    pub fn close(mut self) -> Result<u64, Error> {
        self.finish()
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<(), Error> {
        let path = &self.path;
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(buf).map_err(|source| Error::Write {
                path: path.clone(),
                source,
            }),
            None => Err(Error::Write {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::Other, "file already closed"),
            }),
        }
    }

    fn finish(&mut self) -> Result<u64, Error> {
        let mut counter = match self.stream.take() {
            None => return Ok(0),
            Some(Stream::Plain(counter)) => counter,
            Some(Stream::Lz4(encoder)) => encoder.finish().map_err(|e| Error::Compression {
                path: self.path.clone(),
                message: e.to_string(),
            })?,
        };
        counter.flush().map_err(|source| Error::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(counter.count)
    }
}

impl Drop for Savefile {
    fn drop(&mut self) {
        if self.stream.is_some() {
            if let Err(e) = self.finish() {
                tracing::warn!("{}", e);
            }
        }
    }
}

fn file_header(linktype: Linktype, snaplen: u32) -> [u8; FILE_HEADER_LEN] {
    let mut buf = [0u8; FILE_HEADER_LEN];
    buf[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
    buf[4..6].copy_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
    buf[6..8].copy_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
    // thiszone and sigfigs stay zero
    buf[16..20].copy_from_slice(&snaplen.to_le_bytes());
    buf[20..24].copy_from_slice(&(Linktype::from_dlt(linktype.0).0 as u32).to_le_bytes());
    buf
}

fn record_header(sec: i64, usec: i64, caplen: u32, len: u32) -> [u8; RECORD_HEADER_LEN] {
    let mut buf = [0u8; RECORD_HEADER_LEN];
    buf[0..4].copy_from_slice(&(sec as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&(usec as u32).to_le_bytes());
    buf[8..12].copy_from_slice(&caplen.to_le_bytes());
    buf[12..16].copy_from_slice(&len.to_le_bytes());
    buf
}
