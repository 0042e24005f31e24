//! Secret wrapper for credentials and key material

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value (client secret, access/refresh token, encryption key).
///
/// Redacted in Debug/Display so it never reaches a log line, and wiped from
/// memory when dropped.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// True when the wrapped string is empty (e.g. a client secret that was
    /// never configured).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T: Zeroize> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: Zeroize + Default> Default for Secret<T> {
    fn default() -> Self {
        Self(T::default())
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_debug_and_display() {
        let secret = Secret::new(String::from("at_live_token"));
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn exposes_value() {
        let secret: Secret<String> = String::from("client-secret").into();
        assert_eq!(secret.expose(), "client-secret");
        assert!(!secret.is_empty());
    }

    #[test]
    fn default_is_empty() {
        let secret: Secret<String> = Secret::default();
        assert!(secret.is_empty());
    }

    #[test]
    fn works_for_key_bytes() {
        let key = Secret::new([7u8; 32]);
        let copy = key.clone();
        assert_eq!(copy.expose(), &[7u8; 32]);
        assert_eq!(format!("{key:?}"), "[REDACTED]");
    }
}
