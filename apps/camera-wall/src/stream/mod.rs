//! Camera sessions and everything that moves their output to the consumer.
//!
//! [`StreamSession`] owns one camera graph and its negotiation state,
//! [`FrameRouter`] hands decoded frames across to the consumer context and
//! [`SessionRegistry`] keeps the id → session table.

pub mod registry;
pub mod router;
pub mod session;

pub use registry::{GridLayout, GridState, SessionRegistry};
pub use router::{ConsumerEvent, ConsumerEvents, DecodedFrame, FrameRouter, FrameStats};
pub use session::{SessionObserver, SessionSettings, SessionState, StreamSession};
