//! Shared data structures for the telemetry uplink
//!
//! - `DeliveryPacket`: unit of work handed over by the measurement loop
//! - `LowResSample` / `SiteMetadata`: contents of the low-res batch
//! - `ConnectivityStatus` / `Reachability`: what the network probe reports

mod packet;
mod connectivity;

pub use packet::*;
pub use connectivity::*;
