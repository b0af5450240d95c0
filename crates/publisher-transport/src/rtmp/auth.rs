//! Adobe and Limelight (llnw) RTMP authentication.
//!
//! Both schemes reject the first `connect` with an `_error` whose
//! description carries `key=value` tokens separated by `&`. The client
//! computes a response and reconnects with an auth query appended to the
//! `app` and `tcUrl` of `connect`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use publisher_ipc::Credentials;

/// What to do after `connect` was answered with `_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReply {
    /// Reconnect and announce the auth scheme, expecting a challenge back.
    RequestChallenge { query: String },
    /// Reconnect with computed credentials.
    Respond { query: String },
    /// Authentication failed for good.
    Rejected,
}

/// Value of `key=` in an `&`-separated description.
pub fn token<'a>(description: &'a str, key: &str) -> Option<&'a str> {
    description.split('&').find_map(|part| {
        let part = part.rsplit(['?', ' ']).next().unwrap_or(part);
        part.strip_prefix(key)?.strip_prefix('=')
    })
}

fn md5_base64(input: &str) -> String {
    STANDARD.encode(md5::compute(input.as_bytes()).0)
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

fn random_hex32() -> String {
    format!("{:08x}", fastrand::u32(..))
}

/// Adobe response query.
pub fn adobe_query(
    credentials: &Credentials,
    salt: &str,
    challenge: &str,
    opaque: &str,
    client_challenge: &str,
) -> String {
    let mut response = md5_base64(&format!("{}{}{}", credentials.user, salt, credentials.password));
    if !opaque.is_empty() {
        response.push_str(opaque);
    } else if !challenge.is_empty() {
        response.push_str(challenge);
    }
    let response = md5_base64(&format!("{response}{client_challenge}"));

    let mut query = format!(
        "?authmod=adobe&user={}&challenge={}&response={}",
        credentials.user, client_challenge, response
    );
    if !opaque.is_empty() {
        query.push_str(&format!("&opaque={opaque}"));
    }
    query
}

/// Limelight response query, digest-style over realm `live` and method `publish`.
pub fn llnw_query(credentials: &Credentials, nonce: &str, app: &str, cnonce: &str) -> String {
    const REALM: &str = "live";
    const METHOD: &str = "publish";
    const QOP: &str = "auth";
    const NC: &str = "00000001";

    let mut path = app.split('?').next().unwrap_or(app).to_string();
    if !path.contains('/') {
        path.push_str("/_definst_");
    }

    let ha1 = md5_hex(&format!("{}:{}:{}", credentials.user, REALM, credentials.password));
    let ha2 = md5_hex(&format!("{METHOD}:/{path}"));
    let response = md5_hex(&format!("{ha1}:{nonce}:{NC}:{cnonce}:{QOP}:{ha2}"));

    format!(
        "?authmod=llnw&user={}&nonce={}&cnonce={}&nc={}&response={}",
        credentials.user, nonce, cnonce, NC, response
    )
}

/// Decide how to answer an `_error` to `connect`.
///
/// `responded` is true once computed credentials were already sent; a
/// second rejection is then final.
pub fn handle_connect_error(
    description: &str,
    credentials: Option<&Credentials>,
    app: &str,
    responded: bool,
) -> AuthReply {
    if description.contains("reason=authfail") || description.contains("reason=nosuchuser") {
        return AuthReply::Rejected;
    }
    let Some(credentials) = credentials else {
        return AuthReply::Rejected;
    };
    if responded {
        return AuthReply::Rejected;
    }

    let salt = token(description, "salt");
    let challenge = token(description, "challenge");
    if let (Some(salt), Some(challenge)) = (salt, challenge) {
        let opaque = token(description, "opaque").unwrap_or_default();
        return AuthReply::Respond {
            query: adobe_query(credentials, salt, challenge, opaque, &random_hex32()),
        };
    }
    if let Some(nonce) = token(description, "nonce") {
        return AuthReply::Respond {
            query: llnw_query(credentials, nonce, app, &random_hex32()),
        };
    }

    if description.contains("code=403") {
        for scheme in ["adobe", "llnw"] {
            if description.contains(&format!("authmod={scheme}")) {
                return AuthReply::RequestChallenge {
                    query: format!("?authmod={scheme}&user={}", credentials.user),
                };
            }
        }
    }
    AuthReply::Rejected
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADOBE_CHALLENGE: &str = "[ AccessManager.Reject ] : [ authmod=adobe ] : \
        ?reason=needauth&user=alice&salt=c2FsdA==&challenge=Y2hhbA==&opaque=b3BhcQ==";

    fn alice() -> Credentials {
        Credentials::new("alice", "secret")
    }

    #[test]
    fn test_token_parsing() {
        assert_eq!(token(ADOBE_CHALLENGE, "salt"), Some("c2FsdA=="));
        assert_eq!(token(ADOBE_CHALLENGE, "challenge"), Some("Y2hhbA=="));
        assert_eq!(token(ADOBE_CHALLENGE, "opaque"), Some("b3BhcQ=="));
        assert_eq!(token(ADOBE_CHALLENGE, "reason"), Some("needauth"));
        assert_eq!(token(ADOBE_CHALLENGE, "nonce"), None);
    }

    #[test]
    fn test_adobe_query() {
        let query = adobe_query(&alice(), "c2FsdA==", "Y2hhbA==", "b3BhcQ==", "0000abcd");

        let first = md5_base64("alicec2FsdA==secret");
        let expected = md5_base64(&format!("{first}b3BhcQ==0000abcd"));
        assert_eq!(
            query,
            format!(
                "?authmod=adobe&user=alice&challenge=0000abcd&response={expected}&opaque=b3BhcQ=="
            )
        );
    }

    #[test]
    fn test_llnw_query() {
        let query = llnw_query(&alice(), "n0nce", "live?x=1", "cafebabe");

        let ha1 = md5_hex("alice:live:secret");
        let ha2 = md5_hex("publish:/live/_definst_");
        let response = md5_hex(&format!("{ha1}:n0nce:00000001:cafebabe:auth:{ha2}"));
        assert_eq!(
            query,
            format!(
                "?authmod=llnw&user=alice&nonce=n0nce&cnonce=cafebabe&nc=00000001&response={response}"
            )
        );
    }

    #[test]
    fn test_md5_helpers() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_base64(""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[test]
    fn test_connect_error_flow() {
        let creds = alice();
        let request = handle_connect_error("code=403 need auth; authmod=adobe", Some(&creds), "live", false);
        assert_eq!(
            request,
            AuthReply::RequestChallenge {
                query: "?authmod=adobe&user=alice".to_string()
            }
        );

        assert!(matches!(
            handle_connect_error(ADOBE_CHALLENGE, Some(&creds), "live", false),
            AuthReply::Respond { .. }
        ));
        assert_eq!(
            handle_connect_error(ADOBE_CHALLENGE, Some(&creds), "live", true),
            AuthReply::Rejected
        );
        assert_eq!(
            handle_connect_error("?reason=authfail", Some(&creds), "live", false),
            AuthReply::Rejected
        );
        assert_eq!(
            handle_connect_error("code=403 authmod=adobe", None, "live", false),
            AuthReply::Rejected
        );
    }
}
