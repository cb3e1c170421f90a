//! Payload builders for the AUTH sub-dialogs (RFC 4954).

use hmac::{Hmac, Mac};
use md5::Md5;

/// The authentication mechanisms the session can drive.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AuthKind {
    Plain,
    Login,
    CramMd5,
}

impl AuthKind {
    /// The mechanism name as it appears in the `AUTH` extension line.
    pub fn name(self) -> &'static str {
        match self {
            AuthKind::Plain => "PLAIN",
            AuthKind::Login => "LOGIN",
            AuthKind::CramMd5 => "CRAM-MD5",
        }
    }

    fn bit(self) -> u8 {
        match self {
            AuthKind::Plain => 0b001,
            AuthKind::Login => 0b010,
            AuthKind::CramMd5 => 0b100,
        }
    }
}

/// Set of mechanisms the client is willing to use.
///
/// All of them are allowed by default; disabling one removes it from
/// mechanism selection even when the server advertises it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct AuthSet(u8);

impl AuthSet {
    pub fn all() -> Self {
        AuthSet(0b111)
    }

    pub fn none() -> Self {
        AuthSet(0)
    }

    pub fn contains(self, kind: AuthKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn set(&mut self, kind: AuthKind, enabled: bool) {
        if enabled {
            self.0 |= kind.bit();
        } else {
            self.0 &= !kind.bit();
        }
    }
}

impl Default for AuthSet {
    fn default() -> Self {
        AuthSet::all()
    }
}

/// `AUTH PLAIN` initial response: base64 of `\0username\0password`
/// (empty authorization identity).
pub fn plain_payload(username: &str, password: &str) -> String {
    let mut auth = Vec::with_capacity(username.len() + password.len() + 2);
    auth.push(0);
    auth.extend_from_slice(username.as_bytes());
    auth.push(0);
    auth.extend_from_slice(password.as_bytes());
    base64::encode(&auth)
}

/// First `AUTH LOGIN` continuation: the base64 encoded username.
pub fn login_username(username: &str) -> String {
    base64::encode(username)
}

/// Second `AUTH LOGIN` continuation: the base64 encoded password.
pub fn login_password(password: &str) -> String {
    base64::encode(password)
}

/// `AUTH CRAM-MD5` response for a base64 encoded server challenge.
///
/// The challenge is decoded and HMAC-MD5 digested with the password as
/// key; the reply is `base64(username SP lowercase-hex-digest)`.
pub fn cram_md5_payload(
    username: &str,
    password: &str,
    challenge_b64: &str,
) -> Result<String, base64::DecodeError> {
    let challenge = base64::decode(challenge_b64.trim())?;
    let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(&challenge);
    let digest = hex::encode(mac.finalize().into_bytes());
    Ok(base64::encode(&format!("{} {}", username, digest)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_payload_separates_with_null_bytes() {
        let payload = plain_payload("user", "secret");
        assert_eq!(payload, base64::encode(b"\0user\0secret"));
        assert_eq!(base64::decode(&payload).unwrap(), b"\0user\0secret");
    }

    #[test]
    fn login_payloads_are_plain_base64() {
        assert_eq!(login_username("user"), "dXNlcg==");
        assert_eq!(login_password("secret"), "c2VjcmV0");
    }

    #[test]
    fn cram_md5_matches_the_rfc_2195_example() {
        // RFC 2195 section 2: user "tim", shared secret
        // "tanstaaftanstaaf", digest b913a602c7eda7a495b4e6e7334d3890
        let challenge = base64::encode("<1896.697170952@postoffice.reston.mci.net>");
        let payload = cram_md5_payload("tim", "tanstaaftanstaaf", &challenge).unwrap();
        let decoded = String::from_utf8(base64::decode(&payload).unwrap()).unwrap();
        assert_eq!(decoded, "tim b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn cram_md5_rejects_undecodable_challenges() {
        assert!(cram_md5_payload("tim", "secret", "not base64 !!").is_err());
    }

    #[test]
    fn auth_set_toggles_mechanisms() {
        let mut allowed = AuthSet::default();
        assert!(allowed.contains(AuthKind::Plain));
        assert!(allowed.contains(AuthKind::Login));
        assert!(allowed.contains(AuthKind::CramMd5));
        allowed.set(AuthKind::Login, false);
        assert!(!allowed.contains(AuthKind::Login));
        assert!(allowed.contains(AuthKind::Plain));
        allowed.set(AuthKind::Login, true);
        assert!(allowed.contains(AuthKind::Login));
        assert_eq!(AuthSet::none().contains(AuthKind::Plain), false);
    }
}
