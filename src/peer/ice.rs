use crate::peer::types::IceCandidate;
use tracing::{debug, info, warn};

/// Remote candidates that arrived before the remote description was set.
///
/// Candidates are never dropped: they are held in arrival order and handed
/// back by [`CandidateBuffer::release`] once the remote description is applied.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<IceCandidate>,
    remote_description_set: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate if it can be applied right away, otherwise queues it.
    pub fn accept(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            debug!("Remote description not set yet, queuing candidate");
            self.pending.push(candidate);
            None
        }
    }

    /// Marks the remote description as applied and drains the queue.
    pub fn release(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Per-type tally of a set of candidates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateStats {
    let mut stats = CandidateStats::default();

    for candidate in candidates {
        match candidate.candidate_type() {
            Some("host") => stats.host += 1,
            Some("srflx") | Some("prflx") => stats.srflx += 1,
            Some("relay") => stats.relay += 1,
            _ => {}
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        stats.host, stats.srflx, stats.relay
    );

    if stats.relay == 0 && !candidates.is_empty() {
        warn!("No TURN relay candidates found, connection through symmetric NAT may fail");
    }
    stats
}
