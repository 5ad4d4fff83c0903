use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// What a stop request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    /// Finish the current packet, close files and return
    Graceful,
    /// A stop was already requested; give up on cleanup
    Immediate,
}

/// Shared cancellation flag for a capture run.
///
/// Clones share the same state. The capture loop and the stats reporter poll
/// [`StopToken::is_stopped`]; a signal handler calls [`StopToken::request_stop`].
///
/// ```rust
/// use packetdump::{StopRequest, StopToken};
///
/// let token = StopToken::new();
/// let handler = token.clone();
/// assert_eq!(handler.request_stop(), StopRequest::Graceful);
/// assert!(token.is_stopped());
/// assert_eq!(handler.request_stop(), StopRequest::Immediate);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    requests: Arc<AtomicUsize>,
}

impl StopToken {
    pub fn new() -> StopToken {
        StopToken::default()
    }

    /// Records a stop request. The first one is graceful, every later one immediate.
    pub fn request_stop(&self) -> StopRequest {
        match self.requests.fetch_add(1, Ordering::SeqCst) {
            0 => StopRequest::Graceful,
            _ => StopRequest::Immediate,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.requests.load(Ordering::SeqCst) > 0
    }

    /// True once a second stop has been requested.
    pub fn is_immediate(&self) -> bool {
        self.requests.load(Ordering::SeqCst) > 1
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_escalation() {
        let token = StopToken::new();
        assert!(!token.is_stopped());
        assert_eq!(token.request_stop(), StopRequest::Graceful);
        assert!(token.is_stopped());
        assert!(!token.is_immediate());
        assert_eq!(token.request_stop(), StopRequest::Immediate);
        assert_eq!(token.request_stop(), StopRequest::Immediate);
        assert!(token.is_immediate());
    }

    #[test]
    fn test_exactly_one_graceful_across_threads() {
        let token = StopToken::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let token = token.clone();
                thread::spawn(move || token.request_stop())
            })
            .collect();
        let graceful = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| *r == StopRequest::Graceful)
            .count();
        assert_eq!(graceful, 1);
    }
}
