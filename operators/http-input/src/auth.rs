//! Authentication of the ingest requests.
use base64::{Engine, engine::general_purpose::STANDARD};
use hyper::{
    HeaderMap,
    header::{AUTHORIZATION, HeaderName},
};
use serde::Deserialize;

/// Authentication settings, in the `[auth]` table of the operator.
///
/// Set `username` and `password` for HTTP basic authentication, or `token_header` and
/// `tokens` to accept a request when the header contains one of the tokens.
/// Leave everything unset to disable the authentication.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token_header: Option<String>,
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// Authentication policy, built from an [`AuthConfig`].
#[derive(Debug, Clone)]
pub enum Auth {
    None,
    Basic { username: String, password: String },
    Token { header: HeaderName, tokens: Vec<String> },
}

#[derive(Debug, thiserror::Error)]
pub enum AuthConfigError {
    #[error("username and password must be set together")]
    IncompleteBasic,
    #[error("token_header and tokens must be set together")]
    IncompleteToken,
    #[error("basic and token authentication cannot be used at the same time")]
    Conflict,
    #[error("invalid token_header '{0}'")]
    InvalidHeader(String),
}

impl TryFrom<AuthConfig> for Auth {
    type Error = AuthConfigError;

    fn try_from(config: AuthConfig) -> Result<Self, Self::Error> {
        let basic = match (config.username, config.password) {
            (Some(username), Some(password)) => Some((username, password)),
            (None, None) => None,
            _ => return Err(AuthConfigError::IncompleteBasic),
        };
        let token = match (config.token_header, config.tokens.is_empty()) {
            (Some(header), false) => {
                let header =
                    HeaderName::try_from(header.as_str()).map_err(|_| AuthConfigError::InvalidHeader(header.clone()))?;
                Some((header, config.tokens))
            }
            (None, true) => None,
            _ => return Err(AuthConfigError::IncompleteToken),
        };
        match (basic, token) {
            (Some(_), Some(_)) => Err(AuthConfigError::Conflict),
            (Some((username, password)), None) => Ok(Auth::Basic { username, password }),
            (None, Some((header, tokens))) => Ok(Auth::Token { header, tokens }),
            (None, None) => Ok(Auth::None),
        }
    }
}

impl Auth {
    /// Returns `true` if the headers satisfy the policy.
    pub fn check(&self, headers: &HeaderMap) -> bool {
        match self {
            Auth::None => true,
            Auth::Basic { username, password } => match basic_credentials(headers) {
                Some((u, p)) => {
                    // evaluate both to avoid leaking which one is wrong
                    let user_ok = constant_time_eq(u.as_bytes(), username.as_bytes());
                    let pass_ok = constant_time_eq(p.as_bytes(), password.as_bytes());
                    user_ok & pass_ok
                }
                None => false,
            },
            Auth::Token { header, tokens } => headers.get_all(header).iter().any(|value| {
                tokens
                    .iter()
                    .any(|token| constant_time_eq(value.as_bytes(), token.as_bytes()))
            }),
        }
    }
}

/// Extracts the username and password of the `Authorization: Basic` header.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
