//! EchoRift core: voice session control and chat over a real-time media
//! platform.
//!
//! Pure Rust crate with no UI dependencies. The UI layer subscribes to
//! session snapshots and issues commands; everything platform-specific
//! sits behind the seams in [`platform`].

pub mod devices;
pub mod errors;
pub mod level;
pub mod messages;
pub mod platform;
pub mod playout;
pub mod publisher;
pub mod session;
pub mod settings;
pub mod snapshot;
pub mod token;

#[cfg(feature = "livekit")]
pub mod backend;

pub use errors::RiftError;
pub use session::SessionController;
pub use snapshot::SessionSnapshot;
