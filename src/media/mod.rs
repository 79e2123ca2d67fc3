//! Media Pipeline: local capture, outgoing tracks and remote streams.

pub mod devices;
pub mod pipeline;
pub mod track;

pub use devices::{MediaConstraints, MediaDevices, SampleDevices};
pub use pipeline::{MediaPipeline, OnRemoteStreamHdlrFn, PreviewSink};
pub use track::{LocalStream, LocalTrack, MediaKind, RemoteStream, RemoteTrack};
