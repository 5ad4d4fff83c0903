use std::{
    fmt,
    fs::File,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
};

use chrono::{TimeZone, Utc};
use lz4_flex::frame::FrameDecoder;
use pcap_parser::{traits::PcapReaderIterator, LegacyPcapReader, PcapBlockOwned, PcapError};

use crate::{
    linktype::Linktype,
    packet::{Packet, PacketHeader},
    Error,
};

use super::{Compression, LZ4_FRAME_MAGIC};

const READ_BUFFER: usize = 256 * 1024;

/// A record read back from a savefile, owning its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: PacketHeader,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn as_packet(&self) -> Packet<'_> {
        Packet::new(&self.header, &self.data)
    }
}

/// Reads pcap savefiles, transparently decompressing files that start with an LZ4 frame.
pub struct SavefileReader {
    path: PathBuf,
    compression: Compression,
    linktype: Linktype,
    snaplen: u32,
    nanosecond: bool,
    reader: LegacyPcapReader<Box<dyn Read + Send>>,
}

impl SavefileReader {
    /// Opens `path` and reads its pcap file header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SavefileReader, Error> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| Error::FileOpen {
            path: path.clone(),
            source,
        })?;
        let mut file = BufReader::new(file);
        let head = file.fill_buf().map_err(|e| Error::Format {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let (compression, input): (Compression, Box<dyn Read + Send>) =
            if head.len() >= 4 && head[..4] == LZ4_FRAME_MAGIC.to_le_bytes() {
                (Compression::Lz4, Box::new(FrameDecoder::new(file)))
            } else {
                (Compression::None, Box::new(file))
            };

        let reader = LegacyPcapReader::new(READ_BUFFER, input).map_err(|e| {
            let message = match compression {
                Compression::Lz4 => format!("not a pcap stream inside the lz4 frame: {:?}", e),
                Compression::None => format!("not a pcap file: {:?}", e),
            };
            Error::Format {
                path: path.clone(),
                message,
            }
        })?;
        let mut savefile = SavefileReader {
            path,
            compression,
            linktype: Linktype::NULL,
            snaplen: 0,
            nanosecond: false,
            reader,
        };
        savefile.read_header()?;
        Ok(savefile)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn linktype(&self) -> Linktype {
        self.linktype
    }

    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Reads the next record. `Ok(None)` marks a clean end of file.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let nanosecond = self.nanosecond;
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let frame = match block {
                        PcapBlockOwned::Legacy(b) => {
                            let caplen = (b.caplen as usize).min(b.data.len());
                            Some(Frame {
                                header: PacketHeader::new(
                                    b.ts_sec as i64,
                                    usec(b.ts_usec, nanosecond),
                                    caplen as u32,
                                    b.origlen,
                                ),
                                data: b.data[..caplen].to_vec(),
                            })
                        }
                        PcapBlockOwned::LegacyHeader(_) => None,
                        PcapBlockOwned::NG(_) => {
                            return Err(self.format_error("unexpected pcapng block".to_string()))
                        }
                    };
                    self.reader.consume(offset);
                    if frame.is_some() {
                        return Ok(frame);
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    if let Err(message) = self.reader.refill().map_err(|e| format!("{:?}", e)) {
                        return Err(self.stream_error(message));
                    }
                }
                Err(PcapError::UnexpectedEof) => {
                    return Err(self.stream_error("truncated record".to_string()))
                }
                Err(e) => {
                    let message = format!("{:?}", e);
                    return Err(self.stream_error(message));
                }
            }
        }
    }

    /// Reads every remaining record.
    pub fn read_all(mut self) -> Result<(Linktype, Vec<Frame>), Error> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok((self.linktype, frames))
    }

    fn read_header(&mut self) -> Result<(), Error> {
        loop {
            match self.reader.next() {
                Ok((offset, PcapBlockOwned::LegacyHeader(header))) => {
                    self.linktype = Linktype(header.network.0);
                    self.snaplen = header.snaplen;
                    self.nanosecond = header.is_nanosecond_precision();
                    self.reader.consume(offset);
                    return Ok(());
                }
                Ok(_) => return Err(self.format_error("missing pcap file header".to_string())),
                Err(PcapError::Incomplete(_)) => {
                    if let Err(message) = self.reader.refill().map_err(|e| format!("{:?}", e)) {
                        return Err(self.stream_error(message));
                    }
                }
                Err(e) => {
                    let message = format!("bad pcap file header: {:?}", e);
                    return Err(self.format_error(message));
                }
            }
        }
    }

    /// Whether the file stores nanosecond timestamps. Frames are still returned with
    /// microseconds.
    pub fn is_nanosecond(&self) -> bool {
        self.nanosecond
    }

    fn format_error(&self, message: String) -> Error {
        Error::Format {
            path: self.path.clone(),
            message,
        }
    }

    // Under compression a broken stream is almost always a broken lz4 frame.
    fn stream_error(&self, message: String) -> Error {
        match self.compression {
            Compression::Lz4 => Error::Compression {
                path: self.path.clone(),
                message,
            },
            Compression::None => self.format_error(message),
        }
    }
}

/// Totals for one capture file, as printed when files are read without being rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub path: PathBuf,
    pub linktype: Linktype,
    pub compression: Compression,
    pub snaplen: u32,
    pub packets: u64,
    /// Captured bytes, excluding record headers
    pub bytes: u64,
    pub first: Option<PacketHeader>,
    pub last: Option<PacketHeader>,
}

impl FileSummary {
    /// Reads `path` to the end and totals it.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<FileSummary, Error> {
        let mut reader = SavefileReader::open(path)?;
        let mut summary = FileSummary {
            path: reader.path().to_path_buf(),
            linktype: reader.linktype(),
            compression: reader.compression(),
            snaplen: reader.snaplen(),
            packets: 0,
            bytes: 0,
            first: None,
            last: None,
        };
        while let Some(frame) = reader.next_frame()? {
            summary.packets += 1;
            summary.bytes += frame.data.len() as u64;
            if summary.first.is_none() {
                summary.first = Some(frame.header);
            }
            summary.last = Some(frame.header);
        }
        Ok(summary)
    }
}

/// The sub-second part of a record timestamp in microseconds.
fn usec(fraction: u32, nanosecond: bool) -> i64 {
    if nanosecond {
        fraction as i64 / 1000
    } else {
        fraction as i64
    }
}

fn timestamp(header: &Option<PacketHeader>) -> String {
    let header = match header {
        Some(header) => header,
        None => return "-".to_string(),
    };
    match Utc.timestamp_opt(header.sec(), 0).single() {
        Some(dt) => format!("{}.{:06}", dt.format("%Y-%m-%d %H:%M:%S"), header.usec()),
        None => format!("{}.{:06}", header.sec(), header.usec()),
    }
}

impl fmt::Display for FileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}{}, snaplen {}, {} packets, {} bytes, first {}, last {}",
            self.path.display(),
            self.linktype,
            if self.compression.is_compressed() { ", lz4" } else { "" },
            self.snaplen,
            self.packets,
            self.bytes,
            timestamp(&self.first),
            timestamp(&self.last),
        )
    }
}

impl Iterator for SavefileReader {
    type Item = Result<Frame, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}
