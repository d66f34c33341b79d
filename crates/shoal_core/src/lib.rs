pub mod clock;
pub mod constants;
pub mod lengths;
pub mod metadata;
pub mod peer_id;
pub mod sha256;
pub mod spawn_utils;

pub use metadata::FileMetadata;
pub use peer_id::PeerId;
