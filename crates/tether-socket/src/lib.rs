pub mod client;
pub mod dispatch;

pub use client::{SocketClient, SocketConfig};
pub use dispatch::{HandlerId, HandlerRegistry, StatusRegistry, StatusSubscription};
