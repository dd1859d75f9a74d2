//! fieldnode-uplink: store-and-forward telemetry uplink for field sensor nodes
//!
//! Takes aggregated low-resolution batches and daily high-resolution files
//! from the node's measurement loop and delivers them to a remote archive
//! over whatever transport is up (WiFi, Ethernet, cellular), surviving
//! outages, transient transfer failures and session loss.
//!
//! ## Architecture
//!
//! - **ConnectivityProbe**: active transports and reachability via a
//!   `NetworkAdmin` capability
//! - **RemoteSession / RemoteDirectoryProvisioner**: one ssh + sftp session
//!   with bounded retries, idempotent remote `mkdir -p`
//! - **PacketCodec**: fixed-width binary low-res payload, zstd compressed
//! - **UplinkQueue / UplinkDispatcher**: producer handoff and the delivery
//!   state machine with requeue, session rebuild and outage escalation

pub mod codec;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod diagnostics;
pub mod dry_run;
pub mod lockfile;
pub mod remote;
pub mod source;
pub mod system;
pub mod types;
pub mod uplink;

pub use codec::PacketCodec;
pub use config::UplinkConfig;
pub use connectivity::{ConnectivityProbe, NetworkAdmin, NmcliAdmin};
pub use context::UplinkContext;
pub use diagnostics::DiagnosticLog;
pub use remote::{OpenSshConnector, RemoteDirectoryProvisioner, RemoteSession, RsyncSync};
pub use system::{SystemControl, SystemdReboot};
pub use types::{ConnectivityState, DeliveryPacket, LowResSample, SiteMetadata};
pub use uplink::{Uplink, UplinkDispatcher, UplinkParts, UplinkQueue, UplinkStats};
