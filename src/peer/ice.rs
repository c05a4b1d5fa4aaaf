use crate::logger::dump_candidate;
use crate::peer::connection::PeerTransport;
use crate::peer::types::IceCandidate;
use crate::utils::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FlushState {
    /// Remote description not applied yet
    #[default]
    Buffering,
    /// Drain in progress; late arrivals join the tail of the drain
    Flushing,
    /// Drained, candidates go straight to the transport
    Flushed,
}

#[derive(Debug, Default)]
struct BufferInner {
    queue: VecDeque<IceCandidate>,
    state: FlushState,
}

/// What to do with a remote candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Held until the remote description is applied; carries the queue length
    Buffered(usize),
    /// Buffer already flushed, apply now
    Apply(IceCandidate),
}

/// Outcome of a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
}

/// Remote candidates received before the remote description was applied.
/// Cloning shares the queue; every session owns a fresh buffer.
#[derive(Debug, Clone, Default)]
pub struct CandidateBuffer {
    inner: Arc<Mutex<BufferInner>>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer seeded with candidates that arrived before the session existed
    pub fn with_pending(pending: impl IntoIterator<Item = IceCandidate>) -> Self {
        let buffer = Self::default();
        lock(&buffer.inner).queue.extend(pending);
        buffer
    }

    pub fn admit(&self, candidate: IceCandidate) -> Admission {
        let mut inner = lock(&self.inner);
        match inner.state {
            FlushState::Buffering | FlushState::Flushing => {
                inner.queue.push_back(candidate);
                Admission::Buffered(inner.queue.len())
            }
            FlushState::Flushed => Admission::Apply(candidate),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_flushed(&self) -> bool {
        lock(&self.inner).state == FlushState::Flushed
    }

    /// Drops everything still queued; the buffer accepts no further work.
    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.queue.clear();
        inner.state = FlushState::Flushed;
    }

    /// Applies every buffered candidate in receipt order. Runs once per buffer;
    /// a failing candidate is logged and the drain goes on.
    pub async fn drain_into(&self, transport: &dyn PeerTransport) -> DrainReport {
        {
            let mut inner = lock(&self.inner);
            if inner.state != FlushState::Buffering {
                warn!("Candidate buffer already drained, ignoring");
                return DrainReport::default();
            }
            inner.state = FlushState::Flushing;
        }

        let mut report = DrainReport::default();
        loop {
            let next = {
                let mut inner = lock(&self.inner);
                match inner.queue.pop_front() {
                    Some(candidate) => candidate,
                    None => {
                        inner.state = FlushState::Flushed;
                        break;
                    }
                }
            };
            if apply_candidate(transport, next).await {
                report.applied += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            "Applied pending candidates: {} ok, {} failed",
            report.applied, report.failed
        );
        report
    }
}

/// Apply one remote candidate; failures are logged, not propagated
pub async fn apply_candidate(transport: &dyn PeerTransport, candidate: IceCandidate) -> bool {
    dump_candidate("REMOTE", &candidate);
    match transport.add_ice_candidate(candidate).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to add ICE candidate: {e}");
            false
        }
    }
}

/// Candidates received while idle, kept for the offer they most likely precede.
/// Bounded: the oldest is dropped once full.
#[derive(Debug)]
pub struct EarlyCandidates {
    queue: VecDeque<IceCandidate>,
    capacity: usize,
}

impl EarlyCandidates {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        if self.capacity == 0 {
            debug!("Early candidate hold disabled, dropping candidate");
            return;
        }
        if self.queue.len() == self.capacity {
            warn!("Early candidate hold full, dropping oldest");
            self.queue.pop_front();
        }
        self.queue.push_back(candidate);
    }

    pub fn take(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Counts host / srflx / relay candidates and warns when no relay path exists
pub fn analyze_candidates(candidates: &[IceCandidate]) -> (usize, usize, usize) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        host_count, srflx_count, relay_count
    );
    if relay_count == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    (host_count, srflx_count, relay_count)
}
