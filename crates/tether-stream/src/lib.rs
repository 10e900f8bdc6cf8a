pub mod client;
pub mod frames;
pub mod session;

pub use client::{DeliveryMode, StreamConfig, StreamHandle, StreamingClient};
pub use frames::{FrameDecoder, Payload};
pub use session::{StreamCallbacks, StreamSession};
