//! SSH tunneling for secure database connections (§4.4).

mod tunnel;
pub mod types;

pub use tunnel::SshTunnel;
pub use types::{SshAuthMethod, SshTunnelConfig};
