use std::fmt;

/// Username/password pair for SOCKS5 authentication
#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

// Keep the password out of logs and panic messages
impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_password() {
        let auth = Auth::new("alice".to_string(), "s3cret".to_string());
        let rendered = format!("{:?}", auth);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("s3cret"));
    }
}
