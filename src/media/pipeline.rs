use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::error::{DeviceError, PeerError};
use crate::media::devices::{MediaConstraints, MediaDevices};
use crate::media::track::{LocalStream, RemoteStream, RemoteTrack};
use crate::peer::connection::PeerConnection;

/// Self-view surface for the local stream.
pub trait PreviewSink: Send + Sync {
    fn attach(&self, stream: &LocalStream);
    fn detach(&self);
}

pub type OnRemoteStreamHdlrFn = Box<dyn Fn(RemoteStream) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Clears the in-progress flag even when the acquisition future is dropped.
struct Acquiring<'a>(&'a AtomicBool);

impl Drop for Acquiring<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RemoteSide {
    streams: Vec<RemoteStream>,
    handler: Option<Arc<OnRemoteStreamHdlrFn>>,
}

/// Local capture and remote rendering for one session.
///
/// Incoming tracks are grouped into streams by stream id; the remote-stream
/// handler fires once for every new stream, synchronously on arrival.
pub struct MediaPipeline {
    devices: Arc<dyn MediaDevices>,
    local: Mutex<Option<LocalStream>>,
    previews: Mutex<Vec<Arc<dyn PreviewSink>>>,
    remote: Mutex<RemoteSide>,
    acquiring: AtomicBool,
    // bumped by release_local so an in-flight acquisition knows it is stale
    generation: AtomicU64,
}

impl MediaPipeline {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            local: Mutex::new(None),
            previews: Mutex::new(Vec::new()),
            remote: Mutex::new(RemoteSide::default()),
            acquiring: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Requests camera/microphone. Fails with `AcquireInProgress` when another
    /// acquisition is outstanding, and with `Released` when `release_local`
    /// ran while the devices were being opened.
    pub async fn acquire_local(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, DeviceError> {
        if self.acquiring.swap(true, Ordering::SeqCst) {
            return Err(DeviceError::AcquireInProgress);
        }
        let guard = Acquiring(&self.acquiring);
        let generation = self.generation.load(Ordering::SeqCst);
        let result = self.devices.get_user_media(constraints).await;
        drop(guard);

        let stream = result?;
        if self.generation.load(Ordering::SeqCst) != generation {
            stream.stop();
            return Err(DeviceError::Released);
        }

        let previous = lock(&self.local).replace(stream.clone());
        if let Some(previous) = previous {
            previous.stop();
        }
        for sink in lock(&self.previews).iter() {
            sink.attach(&stream);
        }
        Ok(stream)
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        lock(&self.local).clone()
    }

    /// Attaches `sink` for self-view now, or as soon as a stream is acquired.
    pub fn bind_local_preview(&self, sink: Arc<dyn PreviewSink>) {
        if let Some(stream) = lock(&self.local).as_ref() {
            sink.attach(stream);
        }
        lock(&self.previews).push(sink);
    }

    /// Adds every local track to `pc`; returns how many were added.
    pub async fn attach_to_connection(&self, pc: &dyn PeerConnection) -> Result<usize, PeerError> {
        let Some(stream) = self.local_stream() else {
            warn!("attach_to_connection called without a local stream");
            return Ok(0);
        };
        let mut added = 0;
        for track in stream.tracks().iter().filter(|t| t.is_live()) {
            pc.add_local_track(track).await?;
            debug!("Added local {} track {}", track.kind(), track.id());
            added += 1;
        }
        Ok(added)
    }

    pub fn on_remote_stream(&self, f: OnRemoteStreamHdlrFn) {
        lock(&self.remote).handler = Some(Arc::new(f));
    }

    /// Routes a freshly arrived remote track to its stream.
    pub fn push_remote_track(&self, track: RemoteTrack) {
        let new_stream = {
            let mut remote = lock(&self.remote);
            let existing = remote
                .streams
                .iter()
                .position(|s| s.id() == track.stream_id());
            match existing {
                Some(i) => {
                    remote.streams[i].push(track);
                    None
                }
                None => {
                    let stream = RemoteStream::new(track);
                    remote.streams.push(stream.clone());
                    Some((stream, remote.handler.clone()))
                }
            }
        };

        if let Some((stream, handler)) = new_stream {
            info!("Remote stream {} available", stream.id());
            if let Some(f) = handler {
                f(stream);
            }
        }
    }

    pub fn remote_streams(&self) -> Vec<RemoteStream> {
        lock(&self.remote).streams.clone()
    }

    /// Stops every local track and detaches previews. Safe to call any number
    /// of times, including while an acquisition is still outstanding.
    pub fn release_local(&self) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let stopped = lock(&self.local)
            .take()
            .map(|stream| stream.stop())
            .unwrap_or(0);
        for sink in lock(&self.previews).drain(..) {
            sink.detach();
        }
        if stopped > 0 {
            info!("Stopped {} local tracks", stopped);
        }
        stopped
    }

    pub fn release_remote(&self) -> usize {
        let streams = std::mem::take(&mut lock(&self.remote).streams);
        let stopped: usize = streams.iter().map(|s| s.stop()).sum();
        if stopped > 0 {
            info!("Stopped {} remote tracks", stopped);
        }
        stopped
    }
}
