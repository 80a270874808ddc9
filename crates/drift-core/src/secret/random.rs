//! Locally generated signing material

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use super::{SecretName, SecretSource};
use crate::error::SecretError;
use crate::model::ConfigValue;

/// Serves `generated/<label>` names with fresh CSPRNG output
///
/// Every call produces a new value; callers that need a stable key must seed
/// it once (see `WritePolicy::IfAbsent`).
#[derive(Debug, Clone, Copy)]
pub struct RandomKeySource {
    bytes: usize,
}

impl RandomKeySource {
    /// Default key length in bytes (64 hex chars)
    pub const DEFAULT_BYTES: usize = 32;

    /// Keys of `bytes` bytes, at least 16
    #[inline]
    #[must_use]
    pub fn new(bytes: usize) -> Self {
        Self {
            bytes: bytes.max(16),
        }
    }

    /// Generate one hex-encoded key
    #[must_use]
    pub fn generate(&self) -> ConfigValue {
        let mut buf = Zeroizing::new(vec![0u8; self.bytes]);
        OsRng.fill_bytes(&mut buf);
        ConfigValue::sensitive(hex::encode(&*buf))
    }
}

impl Default for RandomKeySource {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BYTES)
    }
}

#[async_trait]
impl SecretSource for RandomKeySource {
    fn backend(&self) -> &str {
        "random"
    }

    async fn resolve(&self, name: &SecretName) -> Result<ConfigValue, SecretError> {
        if name.namespace() != SecretName::GENERATED {
            return Err(SecretError::NotFound(name.clone()));
        }
        Ok(self.generate())
    }
}
