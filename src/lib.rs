//! Live consultation calls between a patient (sender) and a doctor
//! (receiver): signaling through a pairing relay, offer/answer negotiation
//! with trickled ICE, and local/remote media handling.

pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::ConsultConfig;
pub use error::{Error, Result};
pub use session::{
    MediaStatus, Participant, Role, Session, SessionDeps, SessionHandle, SessionOptions,
    SessionSnapshot,
};
