
pub use fake_peer::*;
pub use session_harness::*;
