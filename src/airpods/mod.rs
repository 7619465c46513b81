//! Accessory protocol and device state.
//!
//! Wire constants and value types, the frame codec, per-device records, the
//! connection session and battery time-to-empty tracking.

pub mod battery;
pub mod codec;
pub mod device;
pub mod protocol;
pub mod recognition;
pub mod session;
