use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Body, Method, Request, Uri};
use hyper_tls::HttpsConnector;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, event, Level};

use crate::config::{Credential, CredentialProvider};
use crate::context::Context;
use crate::error::{Error, ErrorKind};

/// Tokens are refreshed this long before their advertised expiry to avoid races,
///
const EXPIRY_LEEWAY: Duration = Duration::from_secs(30);

/// Lifetime assumed when the token endpoint does not advertise one,
///
const DEFAULT_EXPIRES_IN: u64 = 60;

/// One parsed challenge from a WWW-Authenticate header,
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub params: BTreeMap<String, String>,
}

impl Challenge {
    /// Returns a parameter value,
    ///
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Parses a WWW-Authenticate header into its list of challenges,
///
/// The grammar is `Scheme k1=v1, k2="quoted \" value", Scheme2 ...`; a bare
/// token followed by `=` is a parameter of the current challenge, otherwise
/// it opens the next challenge.
///
pub fn parse_www_authenticate(header: &str) -> Result<Vec<Challenge>, Error> {
    let mut challenges: Vec<Challenge> = vec![];
    let bytes = header.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b',') {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }

        let start = pos;
        while pos < bytes.len()
            && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'-' || bytes[pos] == b'_')
        {
            pos += 1;
        }
        if pos == start {
            return Err(Error::parse_failure(format!(
                "unexpected character in challenge header at {pos}"
            )));
        }
        let token = &header[start..pos];

        while pos < bytes.len() && bytes[pos] == b' ' {
            pos += 1;
        }

        if pos < bytes.len() && bytes[pos] == b'=' {
            pos += 1;
            let value = if pos < bytes.len() && bytes[pos] == b'"' {
                pos += 1;
                let mut value = String::new();
                loop {
                    if pos >= bytes.len() {
                        return Err(Error::parse_failure("unterminated quoted value"));
                    }
                    match bytes[pos] {
                        b'"' => {
                            pos += 1;
                            break;
                        }
                        b'\\' if pos + 1 < bytes.len() => {
                            value.push(bytes[pos + 1] as char);
                            pos += 2;
                        }
                        b => {
                            value.push(b as char);
                            pos += 1;
                        }
                    }
                }
                value
            } else {
                let start = pos;
                while pos < bytes.len() && bytes[pos] != b',' && !bytes[pos].is_ascii_whitespace() {
                    pos += 1;
                }
                header[start..pos].to_string()
            };

            match challenges.last_mut() {
                Some(challenge) => {
                    challenge.params.insert(token.to_string(), value);
                }
                None => {
                    return Err(Error::parse_failure(format!(
                        "parameter {token} before any challenge scheme"
                    )))
                }
            }
        } else {
            challenges.push(Challenge {
                scheme: token.to_string(),
                params: BTreeMap::new(),
            });
        }
    }

    if challenges.is_empty() {
        return Err(Error::parse_failure("empty challenge header"));
    }
    Ok(challenges)
}

/// Response shape of bearer token endpoints,
///
#[derive(Deserialize)]
struct TokenResponse {
    #[serde(rename = "token")]
    token: Option<String>,
    #[serde(rename = "access_token")]
    access_token: Option<String>,
    #[serde(rename = "expires_in")]
    expires_in: Option<u64>,
    #[serde(rename = "issued_at")]
    #[allow(dead_code)]
    issued_at: Option<String>,
}

/// A cached authorization and the challenge it answered,
///
#[derive(Debug, Clone)]
struct TokenEntry {
    authorization: String,
    challenge: Challenge,
    expires_at: Option<Instant>,
}

impl TokenEntry {
    fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() < at,
            None => true,
        }
    }
}

#[derive(Default)]
struct TokenSlot {
    entry: Option<TokenEntry>,
}

type HttpsClient = hyper::Client<HttpsConnector<HttpConnector>>;

/// Authentication engine, acquires and caches authorizations per (host, scope),
///
/// Concurrent challenges for the same (host, scope) single-flight through a
/// per-entry lock, so a 401 storm produces one token acquisition.
///
pub struct Auth {
    client: HttpsClient,
    credentials: Option<Arc<dyn CredentialProvider>>,
    cache: std::sync::Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<TokenSlot>>>>,
}

impl Auth {
    /// Returns a new engine,
    ///
    pub fn new(credentials: Option<Arc<dyn CredentialProvider>>) -> Self {
        Auth {
            client: hyper::Client::builder().build(HttpsConnector::new()),
            credentials,
            cache: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached authorization for (host, scope) when still fresh,
    ///
    pub async fn authorization(&self, host: &str, scope: &str) -> Option<String> {
        let slot = self.slot(host, scope);
        let slot = slot.lock().await;
        slot.entry
            .as_ref()
            .filter(|e| e.is_fresh())
            .map(|e| e.authorization.clone())
    }

    /// Answers a 401 challenge, returning the authorization to retry with,
    ///
    /// `used_authorization` is the Authorization header the failing request
    /// carried. When the challenge matches the cached state and the failing
    /// request already presented the cached token, no progress can be made
    /// and `NoNewChallenge` is returned so the caller stops retrying.
    ///
    pub async fn handle_challenge(
        &self,
        ctx: &Context,
        host: &str,
        scope: &str,
        header: &str,
        used_authorization: Option<&str>,
    ) -> Result<String, Error> {
        let challenges = parse_www_authenticate(header)?;
        let challenge = challenges
            .iter()
            .find(|c| c.scheme.eq_ignore_ascii_case("Bearer"))
            .or_else(|| {
                challenges
                    .iter()
                    .find(|c| c.scheme.eq_ignore_ascii_case("Basic"))
            })
            .ok_or_else(|| Error::parse_failure("no supported challenge scheme"))?
            .clone();

        let slot = self.slot(host, scope);
        let mut slot = slot.lock().await;

        if let Some(entry) = slot.entry.as_ref() {
            let same_challenge = entry.challenge == challenge;
            let caller_used_entry = used_authorization == Some(entry.authorization.as_str());
            if same_challenge && entry.is_fresh() && !caller_used_entry {
                // another flight already refreshed while we waited on the slot
                return Ok(entry.authorization.clone());
            }
            if same_challenge && caller_used_entry {
                debug!("Challenge for {host} {scope} did not change, token is not stale");
                return Err(Error::new(ErrorKind::NoNewChallenge));
            }
        }

        let entry = if challenge.scheme.eq_ignore_ascii_case("Bearer") {
            self.fetch_bearer(ctx, host, scope, &challenge).await?
        } else {
            self.basic_entry(host, &challenge).await?
        };

        let authorization = entry.authorization.clone();
        slot.entry = Some(entry);
        Ok(authorization)
    }

    /// Drops the cached entry for (host, scope),
    ///
    pub async fn invalidate(&self, host: &str, scope: &str) {
        let slot = self.slot(host, scope);
        slot.lock().await.entry = None;
    }

    fn slot(&self, host: &str, scope: &str) -> Arc<tokio::sync::Mutex<TokenSlot>> {
        let mut cache = self.cache.lock().expect("token cache poisoned");
        cache
            .entry((host.to_string(), scope.to_string()))
            .or_default()
            .clone()
    }

    async fn basic_entry(&self, host: &str, challenge: &Challenge) -> Result<TokenEntry, Error> {
        let credential = self.credential(host).await.ok_or_else(|| {
            Error::not_found(format!("no credentials available for basic auth to {host}"))
        })?;
        Ok(TokenEntry {
            authorization: basic_authorization(&credential),
            challenge: challenge.clone(),
            expires_at: None,
        })
    }

    async fn fetch_bearer(
        &self,
        ctx: &Context,
        host: &str,
        scope: &str,
        challenge: &Challenge,
    ) -> Result<TokenEntry, Error> {
        let realm = challenge
            .param("realm")
            .ok_or_else(|| Error::parse_failure("bearer challenge without realm"))?;
        let service = challenge.param("service").unwrap_or(host);
        let scope = challenge.param("scope").unwrap_or(scope);

        let separator = if realm.contains('?') { '&' } else { '?' };
        let uri = format!("{realm}{separator}service={service}&scope={scope}").parse::<Uri>()?;
        event!(Level::DEBUG, "Fetching bearer token from {uri}");

        let mut request = Request::builder().method(Method::GET).uri(uri);
        if let Some(credential) = self.credential(host).await {
            request = request.header("Authorization", basic_authorization(&credential));
        }
        let request = request.body(Body::empty())?;

        let response = ctx.run(self.client.request(request)).await??;
        if !response.status().is_success() {
            event!(
                Level::WARN,
                "Token endpoint answered {} for {host} {scope}",
                response.status()
            );
            return Err(Error::unauthorized().with_message(format!(
                "token endpoint answered {}",
                response.status()
            )));
        }

        let body = ctx.run(hyper::body::to_bytes(response.into_body())).await??;
        let token: TokenResponse = serde_json::from_slice(&body)?;
        let token_value = token
            .token
            .or(token.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::parse_failure("token endpoint returned no token"))?;

        // issued_at is effectively the moment this response arrived
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN));
        let expires_at = Instant::now() + lifetime.saturating_sub(EXPIRY_LEEWAY);

        Ok(TokenEntry {
            authorization: format!("Bearer {token_value}"),
            challenge: challenge.clone(),
            expires_at: Some(expires_at),
        })
    }

    async fn credential(&self, host: &str) -> Option<Credential> {
        match self.credentials.as_ref() {
            Some(provider) => provider.credential(host).await,
            None => None,
        }
    }
}

/// Renders a Basic authorization header value,
///
fn basic_authorization(credential: &Credential) -> String {
    let raw = format!("{}:{}", credential.username, credential.password);
    format!("Basic {}", base64::encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenges = parse_www_authenticate(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:proj/repo:pull""#,
        )
        .expect("should parse");

        assert_eq!(challenges.len(), 1);
        let c = &challenges[0];
        assert_eq!(c.scheme, "Bearer");
        assert_eq!(c.param("realm"), Some("https://auth.example.com/token"));
        assert_eq!(c.param("service"), Some("registry.example.com"));
        assert_eq!(c.param("scope"), Some("repository:proj/repo:pull"));
    }

    #[test]
    fn test_parse_multiple_challenges() {
        let challenges =
            parse_www_authenticate(r#"Basic realm="host", Bearer realm="https://t", error="insufficient_scope""#)
                .expect("should parse");
        assert_eq!(challenges.len(), 2);
        assert_eq!(challenges[0].scheme, "Basic");
        assert_eq!(challenges[1].scheme, "Bearer");
        assert_eq!(challenges[1].param("error"), Some("insufficient_scope"));
    }

    #[test]
    fn test_parse_escaped_quotes_and_unquoted_values() {
        let challenges = parse_www_authenticate(r#"Bearer realm="say \"hi\"", charset=UTF-8"#)
            .expect("should parse");
        assert_eq!(challenges[0].param("realm"), Some(r#"say "hi""#));
        assert_eq!(challenges[0].param("charset"), Some("UTF-8"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_www_authenticate("").is_err());
        assert!(parse_www_authenticate(r#"Bearer realm="unterminated"#).is_err());
        assert!(parse_www_authenticate(r#"realm="no scheme""#).is_err());
    }

    #[test]
    fn test_basic_authorization() {
        let header = basic_authorization(&Credential::new("user", "pass"));
        assert_eq!(header, "Basic dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn test_no_new_challenge_requires_reuse() {
        let auth = Auth::new(None);
        let header = r#"Basic realm="host""#;

        // no credentials configured, basic challenges fail with NotFound
        let err = auth
            .handle_challenge(&Context::background(), "h", "s", header, None)
            .await
            .expect_err("no credentials");
        assert!(err.is(ErrorKind::NotFound));

        use crate::config::StaticCredentials;
        let auth = Auth::new(Some(Arc::new(
            StaticCredentials::new().with("h", Credential::new("user", "pass")),
        )));

        let first = auth
            .handle_challenge(&Context::background(), "h", "s", header, None)
            .await
            .expect("should acquire");

        // a 401 that already presented the cached value cannot make progress
        let err = auth
            .handle_challenge(&Context::background(), "h", "s", header, Some(first.as_str()))
            .await
            .expect_err("identical challenge");
        assert!(err.is(ErrorKind::NoNewChallenge));

        // a racer that had not presented it yet receives the cached value
        let again = auth
            .handle_challenge(&Context::background(), "h", "s", header, None)
            .await
            .expect("cached");
        assert_eq!(again, first);
    }
}
