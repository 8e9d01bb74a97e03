//! External tool driving: subprocess handles, ffprobe probing, and ffmpeg
//! encoder invocations.

pub mod command;
pub mod encoder;
pub mod probe;
pub mod process;
pub mod tools;

pub use command::{ToolCommand, ToolOutput};
pub use encoder::{EncodeJob, EncoderLauncher, FfmpegLauncher};
pub use probe::{AudioProbe, InitProbe, Prober, VideoProbe};
pub use process::Subprocess;
