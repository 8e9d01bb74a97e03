//! reelcast - on-demand HLS video-on-demand server
//!
//! Exposes a media tree as HLS playlists and transcodes sources into
//! MPEG-TS segments with ffmpeg, on demand, steering a bounded set of
//! encoder processes so connected clients keep a buffered lookahead.

pub mod av;
pub mod config;
pub mod debounce;
pub mod error;
pub mod lru;
pub mod media;
pub mod server;
pub mod streaming;

pub use error::{Error, Result};
