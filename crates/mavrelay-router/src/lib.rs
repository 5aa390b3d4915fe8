//! Single-threaded MAVLink routing over epoll.
//!
//! This is the layer that owns descriptors. A [`Mainloop`] holds every
//! [`Endpoint`], waits for readiness, decodes what arrived, hands each frame
//! to a [`RoutingPolicy`] and queues it on the chosen endpoints. Periodic
//! work runs from a small [`TimeoutRegistry`] on the same thread.

pub mod endpoint;
pub mod error;
pub mod mainloop;
pub mod poller;
pub mod routing;
pub mod sink;
pub mod timeout;

pub use endpoint::{
    Delivery, Endpoint, EndpointConfig, EndpointStats, Incoming, ReadStats, WriteStats,
};
pub use error::{DeadReason, Result, RouterError};
pub use mainloop::{Core, EndpointId, EndpointReport, ListenerId, LoopConfig, Mainloop};
pub use poller::{Event, Interest, Poller};
pub use routing::{Broadcast, RoutingPolicy};
pub use sink::LogSink;
pub use timeout::{
    TimeoutAction, TimeoutCallback, TimeoutControl, TimeoutHandle, TimeoutRegistry,
    DEFAULT_TIMEOUT_CAPACITY,
};
