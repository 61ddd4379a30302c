//! Web Services Dynamic Discovery daemon.
//!
//! Makes a non-Windows host visible in the Windows "Network" neighborhood by
//! implementing the WS-Discovery target role, and optionally discovers other
//! such hosts with the client role. Discovery runs over link-local multicast
//! UDP (SOAP-over-UDP) with a per-target HTTP metadata exchange.

pub mod client;
pub mod config;
pub mod context;
pub mod control;
pub mod host;
pub mod http;
pub mod message;
pub mod monitor;
pub mod multicast;
pub mod netlink;
pub mod registry;
pub mod route_bsd;
pub mod scheduler;
pub mod soap;

pub use client::ClientRole;
pub use config::Config;
pub use context::WsdContext;
pub use host::HostRole;
pub use monitor::AddressMonitor;
pub use multicast::{AddressFamily, Interface, MulticastEndpoint};
pub use registry::DeviceRegistry;

/// Version reported by `--version` and startup logging
pub const WSDD_VERSION: &str = env!("CARGO_PKG_VERSION");
