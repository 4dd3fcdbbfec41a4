//! Background health loops
//!
//! The heartbeat monitor pings AUTHENTICATED connections and marks silent ones
//! ERROR; the recovery engine probes ERROR connections with bounded backoff.
//! Both only act through registry operations.

mod heartbeat;
mod recovery;

pub use heartbeat::{HeartbeatMonitor, HeartbeatSweep};
pub use recovery::{RecoveryCommand, RecoveryEngine, RecoveryHandle, RecoverySweep};
