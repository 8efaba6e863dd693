//! # Key Material
//!
//! Long-term RSA keypair of this device. The keypair is only used by the
//! dialing side of a connection: the public half is sent to the remote peer,
//! which uses it to wrap the session seeds (see [`crate::handshake`]).
//!
//! The key is persisted as JSON under the injected config folder with every
//! component base64-encoded. A file that decodes but lacks any component is
//! treated as stale and replaced by a freshly generated key.

use rand::rngs::OsRng;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::{ConfigFolder, LoadResult};
use crate::error::{NetError, Result};
use crate::save;

pub const DEFAULT_KEY_BITS: usize = 2048;

const KEY_FILE: &str = "key.json";

/// Raw RSA components, big-endian unsigned.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    #[serde(default, with = "b64")]
    pub modulus: Option<Vec<u8>>,
    #[serde(default, with = "b64")]
    pub exponent: Option<Vec<u8>>,
    #[serde(default, with = "b64")]
    d: Option<Vec<u8>>,
    #[serde(default, with = "b64")]
    dp: Option<Vec<u8>>,
    #[serde(default, with = "b64")]
    dq: Option<Vec<u8>>,
    #[serde(default, with = "b64")]
    inverse_q: Option<Vec<u8>>,
    #[serde(default, with = "b64")]
    p: Option<Vec<u8>>,
    #[serde(default, with = "b64")]
    q: Option<Vec<u8>>,
}

impl std::fmt::Debug for KeyInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyInfo")
            .field("bits", &self.modulus.as_ref().map(|m| m.len() * 8))
            .field("complete", &self.check())
            .finish_non_exhaustive()
    }
}

impl KeyInfo {
    pub fn generate(bits: usize) -> Result<Self> {
        let mut rng = OsRng;
        let mut key = RsaPrivateKey::new(&mut rng, bits)?;
        key.precompute()?;
        Ok(Self::from_private_key(&key))
    }

    fn from_private_key(key: &RsaPrivateKey) -> Self {
        let primes = key.primes();
        Self {
            modulus: Some(key.n().to_bytes_be()),
            exponent: Some(key.e().to_bytes_be()),
            d: Some(key.d().to_bytes_be()),
            dp: key.dp().map(BigUint::to_bytes_be),
            dq: key.dq().map(BigUint::to_bytes_be),
            inverse_q: key.qinv().map(|qinv| qinv.to_bytes_be().1),
            p: primes.first().map(BigUint::to_bytes_be),
            q: primes.get(1).map(BigUint::to_bytes_be),
        }
    }

    /// All eight components are present and non-empty.
    pub fn check(&self) -> bool {
        [
            &self.modulus,
            &self.exponent,
            &self.d,
            &self.dp,
            &self.dq,
            &self.inverse_q,
            &self.p,
            &self.q,
        ]
        .iter()
        .all(|component| component.as_ref().is_some_and(|bytes| !bytes.is_empty()))
    }

    pub fn public_key(&self) -> Result<RsaPublicKey> {
        let n = component(&self.modulus, "modulus")?;
        let e = component(&self.exponent, "exponent")?;
        Ok(RsaPublicKey::new(n, e)?)
    }

    pub fn private_key(&self) -> Result<RsaPrivateKey> {
        let n = component(&self.modulus, "modulus")?;
        let e = component(&self.exponent, "exponent")?;
        let d = component(&self.d, "d")?;
        let p = component(&self.p, "p")?;
        let q = component(&self.q, "q")?;
        Ok(RsaPrivateKey::from_components(n, e, d, vec![p, q])?)
    }

    /// Decrypts an OAEP (SHA-1) ciphertext addressed to this key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = self.private_key()?;
        Ok(key.decrypt(Oaep::new::<Sha1>(), ciphertext)?)
    }

    /// SHA-256 of the modulus, hex encoded.
    pub fn fingerprint(&self) -> Option<String> {
        self.modulus
            .as_ref()
            .map(|modulus| hex::encode(Sha256::digest(modulus)))
    }
}

fn component(bytes: &Option<Vec<u8>>, name: &str) -> Result<BigUint> {
    bytes
        .as_deref()
        .filter(|b| !b.is_empty())
        .map(BigUint::from_bytes_be)
        .ok_or_else(|| NetError::config(format!("key component `{name}` is missing")))
}

/// Owns the device keypair and its file location.
pub struct KeyConfig {
    path: PathBuf,
    bits: usize,
    key_info: KeyInfo,
}

impl KeyConfig {
    /// The key stays empty until [`KeyConfig::load`] or [`KeyConfig::reset`].
    pub fn new(folder: &ConfigFolder, bits: usize) -> Self {
        Self {
            path: folder.file_path(KEY_FILE),
            bits,
            key_info: KeyInfo::default(),
        }
    }

    pub fn key_info(&self) -> &KeyInfo {
        &self.key_info
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn load(&mut self) -> Result<LoadResult> {
        match save::load_json::<KeyInfo>(&self.path) {
            Ok(key_info) if key_info.check() => {
                self.key_info = key_info;
                Ok(LoadResult::Loaded)
            }
            Ok(_) => {
                warn!("Stored key at {} is incomplete, generating a new one", self.path.display());
                self.key_info = KeyInfo::generate(self.bits)?;
                Ok(LoadResult::Upgraded)
            }
            Err(e) => {
                info!("No usable key at {} ({}), generating a new one", self.path.display(), e);
                self.key_info = KeyInfo::generate(self.bits)?;
                Ok(LoadResult::Created)
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        save::save_json_private(&self.path, &self.key_info)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.key_info = KeyInfo::generate(self.bits)?;
        Ok(())
    }
}

mod b64 {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&BASE64_STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| BASE64_STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TEST_BITS: usize = 1024;

    #[test]
    fn test_generated_key_is_complete() {
        let key = KeyInfo::generate(TEST_BITS).unwrap();
        assert!(key.check());
        assert_eq!(key.modulus.as_ref().unwrap().len(), TEST_BITS / 8);
        assert_eq!(key.fingerprint().unwrap().len(), 64);
    }

    #[test]
    fn test_check_requires_every_component() {
        let key = KeyInfo::generate(TEST_BITS).unwrap();

        for index in 0..8 {
            let mut broken = key.clone();
            let slot = match index {
                0 => &mut broken.modulus,
                1 => &mut broken.exponent,
                2 => &mut broken.d,
                3 => &mut broken.dp,
                4 => &mut broken.dq,
                5 => &mut broken.inverse_q,
                6 => &mut broken.p,
                _ => &mut broken.q,
            };
            *slot = None;
            assert!(!broken.check(), "component {index} missing should fail check");
        }

        assert!(!KeyInfo::default().check());
    }

    #[test]
    fn test_rsa_round_trip() {
        const DATA: i32 = 8_723_563;
        let key = KeyInfo::generate(TEST_BITS).unwrap();

        let public = key.public_key().unwrap();
        let encrypted = public
            .encrypt(&mut OsRng, Oaep::new::<Sha1>(), &DATA.to_le_bytes())
            .unwrap();
        let decrypted = key.decrypt(&encrypted).unwrap();

        assert_eq!(i32::from_le_bytes(decrypted.try_into().unwrap()), DATA);
    }

    #[test]
    fn test_key_config_created_then_loaded() {
        let temp_dir = TempDir::new().unwrap();
        let folder = ConfigFolder::new(temp_dir.path());

        let mut config = KeyConfig::new(&folder, TEST_BITS);
        assert_eq!(config.load().unwrap(), LoadResult::Created);
        config.save().unwrap();

        let mut reloaded = KeyConfig::new(&folder, TEST_BITS);
        assert_eq!(reloaded.load().unwrap(), LoadResult::Loaded);
        assert_eq!(
            reloaded.key_info().fingerprint(),
            config.key_info().fingerprint()
        );
    }

    #[test]
    fn test_incomplete_key_is_upgraded() {
        let temp_dir = TempDir::new().unwrap();
        let folder = ConfigFolder::new(temp_dir.path());

        let mut partial = KeyInfo::generate(TEST_BITS).unwrap();
        partial.dq = None;
        save::save_json(&folder.file_path(KEY_FILE), &partial).unwrap();

        let mut config = KeyConfig::new(&folder, TEST_BITS);
        assert_eq!(config.load().unwrap(), LoadResult::Upgraded);
        assert!(config.key_info().check());
    }

    #[test]
    fn test_reset_replaces_key() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = KeyConfig::new(&ConfigFolder::new(temp_dir.path()), TEST_BITS);
        config.reset().unwrap();
        let before = config.key_info().fingerprint();
        config.reset().unwrap();
        assert_ne!(config.key_info().fingerprint(), before);
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_key_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let mut config = KeyConfig::new(&ConfigFolder::new(temp_dir.path()), TEST_BITS);
        config.reset().unwrap();
        config.save().unwrap();

        let mode = std::fs::metadata(config.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
