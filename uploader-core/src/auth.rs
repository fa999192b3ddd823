// HTTP Basic access gate for the uploader endpoints

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Challenge sent with a 401 when the gate denies a request.
pub const WWW_AUTHENTICATE: &str = "Basic realm=\"Login Required\"";

/// Which endpoint is asking; selects the failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessScope {
    Page,
    Upload,
    Status,
}

impl AccessScope {
    pub fn failure_message(self) -> &'static str {
        match self {
            AccessScope::Page => "Authentication failed",
            AccessScope::Upload => "Authentication failed during upload",
            AccessScope::Status => "Authentication failed for status request",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Granted,
    /// Respond with a 401 challenge; the request must go no further.
    Challenge,
}

#[derive(Clone, PartialEq, Eq)]
struct Credentials {
    username: String,
    password: String,
}

/// Stateless "is this request authorized?" predicate.
///
/// Authentication is enabled only when both username and password are
/// non-empty.
#[derive(Clone, Default)]
pub struct AccessGate {
    credentials: Option<Credentials>,
}

impl AccessGate {
    pub fn new(username: &str, password: &str) -> Self {
        let mut gate = Self::default();
        gate.set_credentials(username, password);
        gate
    }

    /// Returns whether authentication is now enabled.
    pub fn set_credentials(&mut self, username: &str, password: &str) -> bool {
        self.credentials = if username.is_empty() || password.is_empty() {
            None
        } else {
            Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            })
        };
        self.is_enabled()
    }

    pub fn clear(&mut self) {
        self.credentials = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.username.as_str())
    }

    pub fn password(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.password.as_str())
    }

    /// Check an `Authorization` header value against the configured pair.
    pub fn check(&self, authorization: Option<&str>) -> bool {
        let Some(expected) = self.credentials.as_ref() else {
            return true;
        };

        match authorization.and_then(parse_basic) {
            Some((username, password)) => {
                constant_time_eq(username.as_bytes(), expected.username.as_bytes())
                    & constant_time_eq(password.as_bytes(), expected.password.as_bytes())
            }
            None => false,
        }
    }
}

impl core::fmt::Debug for AccessGate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AccessGate")
            .field("enabled", &self.is_enabled())
            .field("username", &self.username())
            .finish()
    }
}

/// Decode `Basic <base64(user:pass)>` into its two halves.
pub fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(token.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Encode credentials the way a client sends them.
pub fn basic_header(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_gate_allows_everything() {
        let gate = AccessGate::default();
        assert!(!gate.is_enabled());
        assert!(gate.check(None));
        assert!(gate.check(Some("Basic garbage")));
    }

    #[test]
    fn test_needs_both_halves_to_enable() {
        assert!(!AccessGate::new("admin", "").is_enabled());
        assert!(!AccessGate::new("", "secret").is_enabled());
        assert!(AccessGate::new("admin", "secret").is_enabled());
    }

    #[test]
    fn test_checks_basic_credentials() {
        let gate = AccessGate::new("admin", "secret");
        assert!(gate.check(Some(&basic_header("admin", "secret"))));
        assert!(!gate.check(Some(&basic_header("admin", "wrong"))));
        assert!(!gate.check(Some(&basic_header("root", "secret"))));
        assert!(!gate.check(Some("Bearer abc")));
        assert!(!gate.check(None));
    }

    #[test]
    fn test_parse_basic() {
        // "user:pa:ss" - only the first colon separates
        assert_eq!(
            parse_basic("basic dXNlcjpwYTpzcw=="),
            Some(("user".to_string(), "pa:ss".to_string()))
        );
        assert_eq!(parse_basic("Basic !!!"), None);
        assert_eq!(parse_basic("Basic"), None);
    }

    #[test]
    fn test_clear_disables() {
        let mut gate = AccessGate::new("admin", "secret");
        gate.clear();
        assert!(!gate.is_enabled());
        assert!(gate.check(None));
    }
}
