//! Credential items and the provider callback.
//!
//! A transport needing authentication builds an ordered list of items,
//! hands it to the provider, and inspects the filled-in values after the
//! callback returns. Secret buffers are wiped on drop so a completed
//! session does not keep passwords in freed memory.

use super::uri::Uri;
use super::TransportError;

/// A secret byte buffer zeroed on drop.
#[derive(Default)]
pub struct Secret {
    bytes: Vec<u8>,
}

impl Secret {
    /// Empty secret.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents, wiping the previous value.
    pub fn set(&mut self, value: &[u8]) {
        self.wipe();
        self.bytes = value.to_vec();
    }

    /// Current value.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    /// Overwrites the buffer with zeros.
    pub fn wipe(&mut self) {
        for byte in &mut self.bytes {
            // Volatile so the wipe is not optimized away as a dead store.
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
        self.bytes.clear();
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(<{} bytes>)", self.bytes.len())
    }
}

/// One credential request item, mutated in place by the provider.
#[derive(Debug)]
pub enum CredentialItem {
    /// A user name.
    Username {
        /// Prompt shown to the user.
        prompt: String,
        /// Filled by the provider.
        value: Option<String>,
    },
    /// A password or token (secret).
    Password {
        prompt: String,
        /// Filled by the provider; wiped on drop.
        value: Secret,
    },
    /// A non-secret free-form string (e.g. a hostkey answer).
    StringType {
        prompt: String,
        value: Option<String>,
    },
    /// A secret free-form buffer.
    CharArrayType {
        prompt: String,
        value: Secret,
    },
    /// A yes/no question (e.g. accept unknown host key).
    YesNoType {
        prompt: String,
        value: Option<bool>,
    },
    /// Text shown to the user, no answer expected.
    InformationalMessage {
        message: String,
    },
}

/// Supplier of credentials for a transport.
pub trait CredentialsProvider {
    /// True when the provider can answer without a human present.
    fn is_interactive(&self) -> bool;

    /// Fills `items` in place for `uri`. Returning `Ok(false)` means the
    /// request was declined; the caller surfaces `Auth`.
    fn get(&mut self, uri: &Uri, items: &mut [CredentialItem]) -> Result<bool, TransportError>;
}

/// Provider that declines every request (the non-interactive default
/// when `GIT_TERMINAL_PROMPT` disables prompting).
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCredentials;

impl CredentialsProvider for NoCredentials {
    fn is_interactive(&self) -> bool {
        false
    }

    fn get(&mut self, _uri: &Uri, _items: &mut [CredentialItem]) -> Result<bool, TransportError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_wipes_on_set() {
        let mut secret = Secret::new();
        secret.set(b"hunter2");
        assert_eq!(secret.expose(), b"hunter2");
        secret.set(b"other");
        assert_eq!(secret.expose(), b"other");
        secret.wipe();
        assert!(secret.expose().is_empty());
    }

    #[test]
    fn provider_fills_items_in_place() {
        struct Fixed;
        impl CredentialsProvider for Fixed {
            fn is_interactive(&self) -> bool {
                false
            }
            fn get(
                &mut self,
                _uri: &Uri,
                items: &mut [CredentialItem],
            ) -> Result<bool, TransportError> {
                for item in items.iter_mut() {
                    match item {
                        CredentialItem::Username { value, .. } => {
                            *value = Some("alice".to_owned())
                        }
                        CredentialItem::Password { value, .. } => value.set(b"tok3n"),
                        _ => {}
                    }
                }
                Ok(true)
            }
        }

        let uri = Uri::parse("https://example.com/r.git").unwrap();
        let mut items = vec![
            CredentialItem::Username {
                prompt: "Username".to_owned(),
                value: None,
            },
            CredentialItem::Password {
                prompt: "Password".to_owned(),
                value: Secret::new(),
            },
        ];
        assert!(Fixed.get(&uri, &mut items).unwrap());
        match (&items[0], &items[1]) {
            (
                CredentialItem::Username { value, .. },
                CredentialItem::Password { value: pass, .. },
            ) => {
                assert_eq!(value.as_deref(), Some("alice"));
                assert_eq!(pass.expose(), b"tok3n");
            }
            _ => unreachable!(),
        }
    }
}
