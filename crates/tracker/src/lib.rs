mod directory;
mod service;

pub use directory::PeerDirectory;
pub use service::{Tracker, TrackerOptions};
