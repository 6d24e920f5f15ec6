//! Persisted collection of server descriptors: validation, id assignment,
//! add/update/remove, and at-rest secret encryption via the vault.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::descriptor::{Address, ServerDescriptor, SshAuth};
use crate::error::{GatewayError, Result};
use crate::vault;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    servers: Vec<ServerDescriptor>,
}

/// Validate a descriptor against the rules in §4.3. Does not touch secrets.
///
/// A dialect's `disabledFeatures` (e.g. SQLite has no `ssh`/`user`/
/// `password`/`ssl` concept) suppresses the matching `server:<field>`
/// checks before the rest of the schema is applied.
pub fn validate(d: &ServerDescriptor) -> Result<()> {
    if d.name.trim().is_empty() {
        return Err(GatewayError::validation("name", "required"));
    }
    if d.client.trim().is_empty() {
        return Err(GatewayError::validation("client", "required"));
    }
    let dialect = crate::descriptor::Dialect::from_key(d.client.trim())
        .ok_or_else(|| GatewayError::validation("client", "unknownDialect"))?;
    let disabled = dialect.disabled_features();
    let suppressed = |field: &str| disabled.contains(&field);

    match &d.address {
        Address::HostPort { host, .. } if host.trim().is_empty() => {
            return Err(GatewayError::validation("host", "required"));
        }
        _ => {}
    }

    if !suppressed("server:user") {
        if let Some(user) = &d.user {
            if user.trim().is_empty() {
                return Err(GatewayError::validation("user", "required"));
            }
        }
    }

    if !suppressed("server:password") {
        if let Some(password) = &d.password {
            if password.is_empty() {
                return Err(GatewayError::validation("password", "required"));
            }
        }
    }

    if !suppressed("server:ssh") {
        if let Some(ssh) = &d.ssh {
            if ssh.host.trim().is_empty() {
                return Err(GatewayError::validation("ssh.host", "required"));
            }
            if !(1..=65535).contains(&ssh.port) {
                return Err(GatewayError::validation("ssh.port", "range"));
            }
            if ssh.user.trim().is_empty() {
                return Err(GatewayError::validation("ssh.user", "required"));
            }
            match &ssh.auth {
                SshAuth::Password { password } if password.is_empty() => {
                    return Err(GatewayError::validation("ssh.password", "required"));
                }
                SshAuth::PrivateKey { private_key, .. } if private_key.is_empty() => {
                    return Err(GatewayError::validation("ssh.privateKey", "required"));
                }
                _ => {}
            }
        }
    }

    Ok(())
}

/// Read the vault key from `$SQLECTRON_VAULT_KEY`, a test/CI convenience;
/// production callers are expected to supply the key programmatically
/// rather than leave it sitting in the environment.
pub fn vault_key_from_env() -> Option<String> {
    std::env::var("SQLECTRON_VAULT_KEY").ok()
}

/// Resolve the registry file path: legacy `~/.sqlectron.json` if it exists,
/// otherwise the platform config directory.
pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(explicit) = std::env::var("SQLECTRON_CONFIG_PATH") {
        return Ok(PathBuf::from(explicit));
    }

    if let Some(home) = dirs::home_dir() {
        let legacy = home.join(".sqlectron.json");
        if legacy.exists() {
            return Ok(legacy);
        }
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| GatewayError::Connect("no config directory available".into()))?;
    Ok(config_dir.join("sqlectron").join("sqlectron.json"))
}

/// The server registry, backed by a JSON file on disk.
pub struct Registry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn at_default_path() -> Result<Self> {
        Ok(Self::new(default_config_path()?))
    }

    async fn read_file(path: &Path) -> Result<RegistryFile> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let empty = RegistryFile::default();
            let json = serde_json::to_string_pretty(&empty)?;
            tokio::fs::write(path, json).await?;
            return Ok(empty);
        }

        let content = tokio::fs::read_to_string(path).await?;
        if content.trim().is_empty() {
            return Ok(RegistryFile::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_file(path: &Path, file: &RegistryFile) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(file)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Synchronous variant of the same persistence contract (§6: "both
    /// async and sync variants exist and must produce byte-identical
    /// JSON").
    fn read_file_sync(path: &Path) -> Result<RegistryFile> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let empty = RegistryFile::default();
            let json = serde_json::to_string_pretty(&empty)?;
            std::fs::write(path, json)?;
            return Ok(empty);
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(RegistryFile::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_file_sync(path: &Path, file: &RegistryFile) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(file)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub async fn get_all(&self) -> Result<Vec<ServerDescriptor>> {
        let _guard = self.lock.lock().await;
        Ok(Self::read_file(&self.path).await?.servers)
    }

    pub fn get_all_sync(&self) -> Result<Vec<ServerDescriptor>> {
        Ok(Self::read_file_sync(&self.path)?.servers)
    }

    fn encrypt_secrets(mut d: ServerDescriptor, vault_key: &str) -> Result<ServerDescriptor> {
        if let Some(password) = &d.password {
            if !password.is_empty() {
                d.password = Some(vault::encrypt(password, vault_key)?);
            }
        }
        if let Some(ssh) = &mut d.ssh {
            if let SshAuth::Password { password } = &mut ssh.auth {
                *password = vault::encrypt(password, vault_key)?;
            }
        }
        d.encrypted = true;
        Ok(d)
    }

    pub async fn add(&self, descriptor: ServerDescriptor, vault_key: &str) -> Result<ServerDescriptor> {
        validate(&descriptor)?;
        let _guard = self.lock.lock().await;
        let mut file = Self::read_file(&self.path).await?;

        let mut fresh = descriptor;
        fresh.id = Some(loop {
            let candidate = Uuid::new_v4();
            if !file.servers.iter().any(|s| s.id == Some(candidate)) {
                break candidate;
            }
        });
        let stored = Self::encrypt_secrets(fresh, vault_key)?;
        file.servers.push(stored.clone());
        Self::write_file(&self.path, &file).await?;
        tracing::debug!(server = %stored.name, dialect = %stored.client, "added server to registry");
        Ok(stored)
    }

    pub async fn update(&self, descriptor: ServerDescriptor, vault_key: &str) -> Result<ServerDescriptor> {
        validate(&descriptor)?;
        let id = descriptor
            .id
            .ok_or_else(|| GatewayError::validation("id", "required"))?;

        let _guard = self.lock.lock().await;
        let mut file = Self::read_file(&self.path).await?;
        let existing = file
            .servers
            .iter()
            .find(|s| s.id == Some(id))
            .cloned()
            .ok_or_else(|| GatewayError::validation("id", "notFound"))?;

        let mut incoming = descriptor;

        // Stable-ciphertext invariant: if the submitted plaintext password
        // matches the currently-stored (decrypted) one, keep the existing
        // ciphertext bytes instead of re-encrypting.
        incoming.password = preserve_if_unchanged(
            existing.password.as_deref(),
            incoming.password.as_deref(),
            vault_key,
        )?;

        if let (Some(existing_ssh), Some(incoming_ssh)) = (&existing.ssh, &mut incoming.ssh) {
            if let (
                SshAuth::Password { password: existing_pw },
                SshAuth::Password { password: incoming_pw },
            ) = (&existing_ssh.auth, &mut incoming_ssh.auth)
            {
                if let Some(kept) =
                    preserve_if_unchanged(Some(existing_pw), Some(incoming_pw), vault_key)?
                {
                    *incoming_pw = kept;
                }
            }
        }

        let stored = Self::encrypt_secrets(incoming, vault_key)?;
        let idx = file.servers.iter().position(|s| s.id == Some(id)).unwrap();
        file.servers[idx] = stored.clone();
        Self::write_file(&self.path, &file).await?;
        tracing::debug!(server = %stored.name, dialect = %stored.client, "updated server in registry");
        Ok(stored)
    }

    pub async fn add_or_update(&self, descriptor: ServerDescriptor, vault_key: &str) -> Result<ServerDescriptor> {
        if descriptor.id.is_some() {
            self.update(descriptor, vault_key).await
        } else {
            self.add(descriptor, vault_key).await
        }
    }

    /// Idempotent: no error if `id` is absent.
    pub async fn remove_by_id(&self, id: Uuid) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = Self::read_file(&self.path).await?;
        file.servers.retain(|s| s.id != Some(id));
        Self::write_file(&self.path, &file).await?;
        tracing::debug!(server_id = %id, "removed server from registry");
        Ok(())
    }

    /// Ensure every descriptor has an id and a defined `ssl`, encrypting
    /// any still-plaintext secrets and marking them `encrypted`.
    pub async fn prepare(&self, vault_key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = Self::read_file(&self.path).await?;
        let mut changed = false;

        for server in &mut file.servers {
            if server.id.is_none() {
                server.id = Some(Uuid::new_v4());
                changed = true;
            }
            if !server.encrypted {
                let prepared = Self::encrypt_secrets(server.clone(), vault_key)?;
                *server = prepared;
                changed = true;
            }
        }

        if changed {
            Self::write_file(&self.path, &file).await?;
        }
        Ok(())
    }
}

/// Returns `Some(existing_ciphertext)` when the submitted plaintext
/// decrypts-equal to the existing one; `Some(incoming)` unchanged
/// otherwise. `None` input passes through as `None`.
fn preserve_if_unchanged(
    existing: Option<&str>,
    incoming: Option<&str>,
    vault_key: &str,
) -> Result<Option<String>> {
    match (existing, incoming) {
        (Some(existing_ct), Some(incoming_pt)) => {
            if let Ok(existing_pt) = vault::decrypt(existing_ct, vault_key) {
                if existing_pt == incoming_pt {
                    return Ok(Some(existing_ct.to_string()));
                }
            }
            Ok(Some(incoming_pt.to_string()))
        }
        (_, incoming) => Ok(incoming.map(|s| s.to_string())),
    }
}

/// Return a copy of `descriptor` with plaintext secrets. No-op when
/// `encrypted` is false.
pub fn decrypt_secrets(descriptor: &ServerDescriptor, vault_key: &str) -> Result<ServerDescriptor> {
    if !descriptor.encrypted {
        return Ok(descriptor.clone());
    }
    let mut out = descriptor.clone();
    if let Some(password) = &out.password {
        out.password = Some(vault::decrypt(password, vault_key)?);
    }
    if let Some(ssh) = &mut out.ssh {
        if let SshAuth::Password { password } = &mut ssh.auth {
            *password = vault::decrypt(password, vault_key)?;
        }
    }
    out.encrypted = false;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Address, ServerDescriptor};
    use tempfile::tempdir;

    fn sample() -> ServerDescriptor {
        ServerDescriptor {
            id: None,
            name: "a".into(),
            client: "postgresql".into(),
            address: Address::HostPort {
                host: "h".into(),
                port: 5432,
            },
            database: None,
            user: Some("u".into()),
            password: Some("p".into()),
            ssl: false,
            ssh: None,
            encrypted: false,
        }
    }

    #[tokio::test]
    async fn add_then_decrypt_round_trips_except_id_and_encrypted() {
        let dir = tempdir().unwrap();
        let reg = Registry::new(dir.path().join("sqlectron.json"));

        let stored = reg.add(sample(), "KEY").await.unwrap();
        assert!(stored.id.is_some());
        assert!(stored.encrypted);

        let plain = decrypt_secrets(&stored, "KEY").unwrap();
        assert_eq!(plain.password.as_deref(), Some("p"));
        assert!(!plain.encrypted);
    }

    #[tokio::test]
    async fn remove_by_id_is_idempotent() {
        let dir = tempdir().unwrap();
        let reg = Registry::new(dir.path().join("sqlectron.json"));
        let stored = reg.add(sample(), "KEY").await.unwrap();
        let id = stored.id.unwrap();

        reg.remove_by_id(id).await.unwrap();
        assert!(reg.get_all().await.unwrap().is_empty());
        // second removal of the same id must not error
        reg.remove_by_id(id).await.unwrap();
    }

    #[tokio::test]
    async fn update_with_unchanged_password_keeps_ciphertext_bytes() {
        let dir = tempdir().unwrap();
        let reg = Registry::new(dir.path().join("sqlectron.json"));
        let stored = reg.add(sample(), "KEY").await.unwrap();

        let mut resubmit = decrypt_secrets(&stored, "KEY").unwrap();
        resubmit.id = stored.id;
        resubmit.name = "renamed".into();
        let updated = reg.update(resubmit, "KEY").await.unwrap();

        assert_eq!(updated.password, stored.password);
        assert_eq!(updated.name, "renamed");
    }

    #[tokio::test]
    async fn update_with_changed_password_reencrypts() {
        let dir = tempdir().unwrap();
        let reg = Registry::new(dir.path().join("sqlectron.json"));
        let stored = reg.add(sample(), "KEY").await.unwrap();

        let mut resubmit = decrypt_secrets(&stored, "KEY").unwrap();
        resubmit.id = stored.id;
        resubmit.password = Some("new-password".into());
        let updated = reg.update(resubmit, "KEY").await.unwrap();

        assert_ne!(updated.password, stored.password);
        assert_eq!(
            decrypt_secrets(&updated, "KEY").unwrap().password.as_deref(),
            Some("new-password")
        );
    }

    #[test]
    fn validation_rejects_missing_name() {
        let mut d = sample();
        d.name = "  ".into();
        assert!(validate(&d).is_err());
    }

    #[test]
    fn validation_rejects_unknown_dialect() {
        let mut d = sample();
        d.client = "oracle".into();
        assert!(validate(&d).is_err());
    }

    #[test]
    fn sqlite_disabled_features_suppress_ssh_validation() {
        use crate::descriptor::{SshAuth, SshDescriptor};

        let mut d = sample();
        d.client = "sqlite".into();
        // an ssh block that would fail validation on its own (empty host)
        d.ssh = Some(SshDescriptor {
            host: "".into(),
            port: 22,
            user: "u".into(),
            auth: SshAuth::Password { password: "p".into() },
        });
        assert!(validate(&d).is_ok());
    }

    #[test]
    fn postgresql_still_validates_ssh_when_present() {
        use crate::descriptor::{SshAuth, SshDescriptor};

        let mut d = sample();
        d.ssh = Some(SshDescriptor {
            host: "".into(),
            port: 22,
            user: "u".into(),
            auth: SshAuth::Password { password: "p".into() },
        });
        assert!(validate(&d).is_err());
    }
}
