//! Built-in channel handlers.
//!
//! Each module implements the `ChannelHandler` contract for one named
//! service endpoint. Registration happens once in `main`; everything here
//! is ordinary request/reply logic with no knowledge of transports or
//! sessions beyond the `ClientInfo` identity.

mod environment;
mod files;
mod logging;

pub use environment::EnvironmentChannel;
pub use files::FilesChannel;
pub use logging::{FilterHandle, LogLevelChannel};
