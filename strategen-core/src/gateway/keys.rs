//! API keys, read once at gateway construction.

use std::collections::BTreeMap;
use std::fmt;

use super::registry::ProviderKind;
use super::GatewayError;

/// Provider API keys. `Debug` never prints key material.
#[derive(Clone, Default)]
pub struct ApiKeys {
    keys: BTreeMap<ProviderKind, String>,
}

impl ApiKeys {
    /// Read every supported key variable. Empty values count as absent.
    pub fn from_env() -> Self {
        let mut keys = BTreeMap::new();
        for provider in ProviderKind::ALL {
            if let Some(var) = provider.key_var() {
                if let Ok(value) = std::env::var(var) {
                    let value = value.trim().to_string();
                    if !value.is_empty() {
                        keys.insert(provider, value);
                    }
                }
            }
        }
        Self { keys }
    }

    pub fn with(mut self, provider: ProviderKind, key: impl Into<String>) -> Self {
        self.keys.insert(provider, key.into());
        self
    }

    pub fn get(&self, provider: ProviderKind) -> Option<&str> {
        self.keys.get(&provider).map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn providers(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.keys.keys().copied()
    }

    pub(crate) fn require(&self, provider: ProviderKind) -> Result<&str, GatewayError> {
        self.get(provider).ok_or_else(|| {
            GatewayError::ProviderUnavailable(format!(
                "no API key for '{provider}' (set {})",
                provider.key_var().unwrap_or("an API key")
            ))
        })
    }
}

impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys.keys()).finish()
    }
}
