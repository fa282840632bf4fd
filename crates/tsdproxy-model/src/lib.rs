//! Shared data model for tsdproxy.
//!
//! This crate holds the types every other crate agrees on: the proxy
//! configuration handed from target providers to the manager, the port
//! label grammars, the proxy status state machine and its broadcast
//! events, and the whois identity attached to forwarded requests.

pub mod port;
pub mod proxyconfig;
pub mod status;
pub mod whois;

pub use port::{PortConfig, PortParseError, Protocol, TailscalePort};
pub use proxyconfig::{DashboardConfig, PortConfigList, ProxyConfig, TailscaleConfig};
pub use status::{ProxyEvent, ProxyStatus};
pub use whois::{Whois, HEADER_DISPLAY_NAME, HEADER_PROFILE_PIC_URL, HEADER_USERNAME};
