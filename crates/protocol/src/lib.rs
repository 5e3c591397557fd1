pub mod constants;
pub mod frame;
pub mod subscription;

// Re-export primary types for convenience.
pub use constants::FrameKind;
pub use frame::{FrameError, InboundFrame, InitPayload, OutboundFrame, StartPayload};
pub use subscription::SubscriptionRequest;
