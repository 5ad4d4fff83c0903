//! Background sampling of capture statistics.

use std::{
    io::{self, Write},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    capture::{Stat, StatsSource},
    stop::StopToken,
    Error,
};

// Longest the reporter sleeps before rechecking whether it should stop.
const POLL_SLICE: Duration = Duration::from_millis(20);

/// Called with every sample the reporter takes.
pub type StatsSink = Box<dyn FnMut(&Stat) + Send>;

/// The latest sample, readable without locking.
#[derive(Debug, Default)]
struct Latest {
    received: AtomicU32,
    dropped: AtomicU32,
    if_dropped: AtomicU32,
    samples: AtomicU64,
}

impl Latest {
    fn store(&self, stat: &Stat) {
        self.received.store(stat.received, Ordering::Relaxed);
        self.dropped.store(stat.dropped, Ordering::Relaxed);
        self.if_dropped.store(stat.if_dropped, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Release);
    }

    fn load(&self) -> Option<Stat> {
        if self.samples.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(Stat::new(
            self.received.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
            self.if_dropped.load(Ordering::Relaxed),
        ))
    }
}

/// A thread that polls a [`StatsSource`] every interval until stopped.
///
/// The reporter never touches output files, so stopping it is always safe.
pub struct StatsReporter {
    latest: Arc<Latest>,
    done: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StatsReporter {
    /// Starts sampling `source` every `interval` until [`StatsReporter::stop`] is called or
    /// `stop` fires.
    pub fn spawn(
        source: Box<dyn StatsSource>,
        interval: Duration,
        stop: StopToken,
        mut sink: Option<StatsSink>,
    ) -> Result<StatsReporter, Error> {
        let latest = Arc::new(Latest::default());
        let done = Arc::new(AtomicBool::new(false));

        let thread = {
            let latest = latest.clone();
            let done = done.clone();
            thread::Builder::new()
                .name("stats".to_string())
                .spawn(move || {
                    let mut unsupported = false;
                    while wait(interval, &done, &stop) {
                        if unsupported {
                            continue;
                        }
                        match source.stats() {
                            Ok(stat) => {
                                tracing::trace!("{:?}", stat);
                                latest.store(&stat);
                                if let Some(sink) = sink.as_mut() {
                                    sink(&stat);
                                }
                            }
                            Err(e @ Error::Unsupported(_)) => {
                                tracing::warn!("statistics unavailable: {}", e);
                                unsupported = true;
                            }
                            Err(e) => tracing::debug!("statistics: {}", e),
                        }
                    }
                })
                .map_err(|e| {
                    Error::ReadFailure(format!("couldn't start statistics thread: {}", e))
                })?
        };

        Ok(StatsReporter {
            latest,
            done,
            thread: Some(thread),
        })
    }

    /// The most recent sample, `None` before the first one.
    pub fn latest(&self) -> Option<Stat> {
        self.latest.load()
    }

    /// Stops the thread, waits for it, and returns the last sample.
    pub fn stop(mut self) -> Option<Stat> {
        self.shutdown();
        self.latest.load()
    }

    fn shutdown(&mut self) {
        self.done.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("statistics thread panicked");
            }
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleeps for `interval`, returning false as soon as either flag asks the reporter to quit.
fn wait(interval: Duration, done: &AtomicBool, stop: &StopToken) -> bool {
    let mut left = interval;
    while !left.is_zero() {
        if done.load(Ordering::Acquire) || stop.is_stopped() {
            return false;
        }
        let slice = left.min(POLL_SLICE);
        thread::sleep(slice);
        left -= slice;
    }
    !(done.load(Ordering::Acquire) || stop.is_stopped())
}

/// Formats a sample the way the status line shows it.
pub fn status_text(stat: &Stat) -> String {
    format!("packets={}, drops={}", stat.received, stat.total_dropped())
}

/// A sink that keeps an updating `packets=N, drops=M` line on stderr.
pub fn status_line() -> StatsSink {
    Box::new(|stat: &Stat| {
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "{:<40}\r", status_text(stat));
        let _ = stderr.flush();
    })
}
