pub mod audio;
pub mod config;
pub mod session;
pub mod transport;

pub use session::{LiveSession, SessionStatus, run_session};
