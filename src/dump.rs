//! The capture loop.
//!
//! [`run`] opens a session as configured and hands it to [`dump`], which moves packets
//! into rotating files until the input ends, an error occurs, or the [`StopToken`] fires.

use crate::{
    capture::{offline::Offline, Provider, Session, Stat},
    config::CaptureConfig,
    device::Device,
    linktype::Linktype,
    rotation::Rotator,
    stats::{self, StatsReporter},
    stop::StopToken,
    Error,
};

/// What a capture run produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DumpSummary {
    /// Packets written
    pub packets: u64,
    /// Output files opened, including ones later removed by retention
    pub files_opened: u64,
    /// Bytes committed to output files
    pub bytes: u64,
    /// Last statistics sample from the capture backend
    pub stats: Option<Stat>,
}

/// Opens the session `config` describes: a replay of `read_files` if there are any,
/// otherwise a live capture on `interface` or on the first device `provider` lists.
pub fn open_session(
    config: &CaptureConfig,
    provider: &dyn Provider,
) -> Result<Box<dyn Session>, Error> {
    let mut session: Box<dyn Session> = if config.is_replay() {
        Box::new(Offline::open(&config.read_files)?)
    } else {
        let device = match &config.interface {
            Some(name) => Device::from(name.as_str()),
            None => Device::lookup(provider)?.ok_or_else(|| Error::CaptureUnavailable {
                interface: "default".to_string(),
                message: "no adapters found, are you sure you are root?".to_string(),
            })?,
        };
        let session = config.capture(device).open(provider)?;
        tracing::info!(
            "{}: link type {}",
            session.name(),
            describe(session.datalink(), provider)
        );
        session
    };

    if let Some(program) = config.filter_program()? {
        session.filter(&program, true)?;
        tracing::debug!("{}: filter \"{}\"", session.name(), program);
    }
    tracing::info!("{}: capture started", session.name());
    Ok(session)
}

/// Names a link type for the log, falling back to what the crate knows by itself.
fn describe(linktype: Linktype, provider: &dyn Provider) -> String {
    match (linktype.get_name(provider), linktype.get_description(provider)) {
        (Ok(name), Ok(description)) => format!("{} ({})", name, description),
        (Ok(name), Err(_)) => name,
        (Err(e), _) => {
            tracing::debug!("{}", e);
            linktype.to_string()
        }
    }
}

/// Opens a session, drops privileges if asked to, and captures until done.
pub fn run(
    config: &CaptureConfig,
    provider: &dyn Provider,
    stop: &StopToken,
) -> Result<DumpSummary, Error> {
    let mut session = open_session(config, provider)?;
    #[cfg(unix)]
    if let Some(user) = &config.drop_user {
        crate::privilege::drop_to(user)?;
    }
    dump(session.as_mut(), config, stop)
}

/// Reads packets from `session` into rotating files until the session runs dry, a packet
/// can't be read or written, or `stop` fires.
///
/// The current file is closed and the statistics thread joined on every exit path. When
/// the loop ended on an error, that error is returned after cleanup.
pub fn dump(
    session: &mut dyn Session,
    config: &CaptureConfig,
    stop: &StopToken,
) -> Result<DumpSummary, Error> {
    let reporter = StatsReporter::spawn(
        session.stats_source(),
        config.stats_interval,
        stop.clone(),
        config.status_line.then(stats::status_line),
    )?;
    let mut rotator = Rotator::new(config, session.datalink(), session.snaplen());

    let mut failure = None;
    while !stop.is_stopped() {
        match session.next_packet() {
            Ok(packet) => {
                if let Err(e) = rotator.write(&packet) {
                    failure = Some(e);
                    break;
                }
            }
            Err(e) if !e.is_fatal() => continue,
            Err(Error::NoMorePackets) => {
                tracing::debug!("{}: end of input", session.name());
                break;
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let sampled = reporter.stop();
    let closed = rotator.close();
    let summary = DumpSummary {
        packets: rotator.packets(),
        files_opened: rotator.files_opened(),
        bytes: rotator.bytes(),
        stats: session.stats_source().stats().ok().or(sampled),
    };
    tracing::info!(
        "read {} packets into {} files",
        summary.packets,
        summary.files_opened
    );

    match (failure, closed) {
        (Some(e), closed) => {
            if let Err(close_error) = closed {
                tracing::warn!("{}", close_error);
            }
            tracing::error!("{}", e);
            Err(e)
        }
        (None, closed) => closed.map(|_| summary),
    }
}
