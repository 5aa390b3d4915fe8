//! MAVLink telemetry routing between serial, UDP and TCP links.
//!
//! mavrelay validates MAVLink v1/v2 frames off every link it owns and
//! forwards them to the others from a single-threaded epoll loop.
//!
//! # Crate Structure
//!
//! - [`transport`]: non-blocking serial, UDP and TCP transports
//! - [`frame`]: frame detection, checksum validation, serialization and tlog files
//! - [`router`]: endpoints, timeouts and the event loop

/// Re-export transport types.
pub mod transport {
    pub use mavrelay_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use mavrelay_frame::*;
}

/// Re-export router types.
pub mod router {
    pub use mavrelay_router::*;
}
