//! SSH tunnel configuration types.

use crate::descriptor::{SshAuth, SshDescriptor};

/// Authentication method for an SSH tunnel session.
#[derive(Debug, Clone)]
pub enum SshAuthMethod {
    Password(String),
    PrivateKey {
        private_key_path: String,
        passphrase: Option<String>,
    },
}

/// Fully-resolved (plaintext secrets) configuration for one SSH tunnel.
#[derive(Debug, Clone)]
pub struct SshTunnelConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub auth: SshAuthMethod,
    pub remote_host: String,
    pub remote_port: u16,
}

impl SshTunnelConfig {
    pub fn from_descriptor(
        ssh: &SshDescriptor,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        let auth = match &ssh.auth {
            SshAuth::Password { password } => SshAuthMethod::Password(password.clone()),
            SshAuth::PrivateKey {
                private_key,
                passphrase,
            } => SshAuthMethod::PrivateKey {
                private_key_path: private_key.clone(),
                passphrase: passphrase.clone(),
            },
        };
        Self {
            ssh_host: ssh.host.clone(),
            ssh_port: ssh.port,
            ssh_user: ssh.user.clone(),
            auth,
            remote_host: remote_host.into(),
            remote_port,
        }
    }
}
