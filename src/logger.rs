use crate::peer::types::IceCandidate;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;

pub const DEFAULT_FILTER: &str = "consult_rtc=info";

/// Installs the fmt subscriber; `RUST_LOG` overrides the default filter.
/// Safe to call more than once.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Logs an ICE candidate as it trickles.
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}

/// Stats snapshot of the nominated candidate pair
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{} bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
