//! Token-based authorization
//!
//! Two orthogonal mechanisms guard the control API: a shared API secret
//! (compared in constant time, see [`constant_time_eq`]) and a token
//! store with per-plugin access lists. Either one satisfies a request;
//! the token -> plugin ACL is additionally enforced at `attach` time.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

/// Token store mapping each valid token to the plugin packages it may
/// attach to. Disabled stores accept every token and every plugin.
pub struct TokenAuth {
    enabled: bool,
    tokens: RwLock<HashMap<String, HashSet<String>>>,
}

impl TokenAuth {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Add a token. Adding an existing token is a no-op that still
    /// succeeds.
    pub fn add_token(&self, token: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.tokens
            .write()
            .entry(token.to_string())
            .or_default();
        true
    }

    /// Whether this token is currently valid
    pub fn check_token(&self, token: &str) -> bool {
        if !self.enabled {
            return true;
        }
        self.tokens.read().contains_key(token)
    }

    /// Grant a token access to a plugin package
    pub fn allow_plugin(&self, token: &str, package: &str) -> bool {
        if !self.enabled {
            return false;
        }
        match self.tokens.write().get_mut(token) {
            Some(allowed) => {
                allowed.insert(package.to_string());
                true
            }
            None => false,
        }
    }

    /// Revoke a token's access to a plugin package
    pub fn disallow_plugin(&self, token: &str, package: &str) -> bool {
        if !self.enabled {
            return false;
        }
        match self.tokens.write().get_mut(token) {
            Some(allowed) => {
                allowed.remove(package);
                true
            }
            None => false,
        }
    }

    /// Whether this token may attach to the given plugin package
    pub fn check_plugin(&self, token: &str, package: &str) -> bool {
        if !self.enabled {
            return true;
        }
        self.tokens
            .read()
            .get(token)
            .is_some_and(|allowed| allowed.contains(package))
    }

    /// Remove a token entirely
    pub fn remove_token(&self, token: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.tokens.write().remove(token).is_some()
    }

    /// All currently valid tokens
    pub fn list_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.tokens.read().keys().cloned().collect();
        tokens.sort();
        tokens
    }

    /// Plugin packages a token may attach to
    pub fn allowed_plugins(&self, token: &str) -> Vec<String> {
        let mut plugins: Vec<String> = self
            .tokens
            .read()
            .get(token)
            .map(|allowed| allowed.iter().cloned().collect())
            .unwrap_or_default();
        plugins.sort();
        plugins
    }
}

/// Constant-time comparison to prevent timing attacks on secrets
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
