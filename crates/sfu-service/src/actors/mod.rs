//! Actor hierarchy for the control plane.
//!
//! ```text
//! ControllerActor (singleton per process)
//! ├── owns the channel registries (by uuid, by issuer)
//! └── ChannelActor (one per channel)
//!     ├── owns the session map, capacity and idle deadline
//!     └── SessionActor (one per participant)
//!         ├── owns its bus, transports, producers and consumers
//!         └── spawns named tasks for transport init, pings and
//!             consumer creation
//! ```
//!
//! All cross-actor traffic flows through the message enums in [`messages`];
//! actor loops never synchronously wait on another actor's loop, so the
//! hierarchy cannot deadlock on request cycles.

pub mod channel;
pub mod controller;
pub mod messages;
pub mod session;

pub use channel::{ChannelActor, ChannelActorHandle};
pub use controller::ControllerActorHandle;
pub use messages::{
    ChannelAccess, ChannelStats, CloseReason, SessionInfo, SessionState, SessionStats,
};
pub use session::{SessionActor, SessionActorHandle, SessionContext};
