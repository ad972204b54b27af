//! HTTP digest authentication (RFC 2617, MD5, `qop=auth`).
//!
//! The last challenge is cached and reused with an increasing nonce count,
//! so steady-state polling costs one round trip. A 401 refreshes the
//! challenge and the request is retried once.

use crate::adapter::{AdapterError, AdapterResult};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use tracing::debug;

/// Parsed `WWW-Authenticate: Digest ...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// Whether the server offered `qop=auth`
    pub qop_auth: bool,
}

impl Challenge {
    /// Parse a digest challenge. Returns `None` for other schemes.
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("Digest")?.trim_start();
        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;

        for (key, value) in split_params(rest) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => qop_auth = value.split(',').any(|q| q.trim() == "auth"),
                "algorithm" if !value.eq_ignore_ascii_case("MD5") => return None,
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            qop_auth,
        })
    }
}

/// Split `k=v, k="v, with comma"` pairs.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_string();
        }
        params.push((key.trim().to_string(), value));
    }
    params
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compute the `Authorization` header value.
pub fn authorization(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &Challenge,
    nc: u32,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, challenge.realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    let nc = format!("{:08x}", nc);

    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
        username, challenge.realm, challenge.nonce, uri
    );
    if challenge.qop_auth {
        let response = md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, challenge.nonce, nc, cnonce, ha2
        ));
        header.push_str(&format!(
            ", qop=auth, nc={}, cnonce=\"{}\", response=\"{}\"",
            nc, cnonce, response
        ));
    } else {
        let response = md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2));
        header.push_str(&format!(", response=\"{}\"", response));
    }
    header.push_str(", algorithm=MD5");
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    header
}

struct Session {
    challenge: Challenge,
    nc: u32,
}

/// HTTP client that answers digest challenges.
pub struct DigestClient {
    http: Client,
    username: String,
    password: String,
    session: Mutex<Option<Session>>,
}

impl DigestClient {
    pub fn new(http: Client, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            http,
            username: username.into(),
            password: password.into(),
            session: Mutex::new(None),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Drop the cached challenge.
    pub fn reset(&self) {
        *self.session.lock() = None;
    }

    fn auth_header(&self, method: &Method, url: &str) -> AdapterResult<Option<String>> {
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            return Ok(None);
        };
        session.nc += 1;
        let cnonce = hex::encode(rand::random::<[u8; 8]>());
        Ok(Some(authorization(
            &self.username,
            &self.password,
            method.as_str(),
            &request_uri(url)?,
            &session.challenge,
            session.nc,
            &cnonce,
        )))
    }

    /// Store the challenge from a 401. Returns `false` if there was none.
    fn absorb_challenge(&self, response: &Response) -> bool {
        let challenge = response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(Challenge::parse);
        match challenge {
            Some(challenge) => {
                debug!(realm = %challenge.realm, "New digest challenge");
                *self.session.lock() = Some(Session { challenge, nc: 0 });
                true
            }
            None => false,
        }
    }

    /// Send a request, answering one challenge if needed.
    ///
    /// `build` may run twice, so it must be able to recreate the body.
    pub async fn send<F>(&self, method: Method, url: &str, build: F) -> AdapterResult<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let response = self.send_once(method.clone(), url, &build).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        if !self.absorb_challenge(&response) {
            return Ok(response);
        }
        self.send_once(method, url, &build).await
    }

    async fn send_once<F>(&self, method: Method, url: &str, build: &F) -> AdapterResult<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let mut request = build(self.http.request(method.clone(), url));
        if let Some(header) = self.auth_header(&method, url)? {
            request = request.header(AUTHORIZATION, header);
        }
        Ok(request.send().await?)
    }

    /// Send a request whose body can only be produced once.
    ///
    /// Call [`DigestClient::prime`] first so a valid challenge is cached.
    pub async fn send_single(
        &self,
        method: Method,
        url: &str,
        request: RequestBuilder,
    ) -> AdapterResult<Response> {
        let mut request = request;
        if let Some(header) = self.auth_header(&method, url)? {
            request = request.header(AUTHORIZATION, header);
        }
        let response = request.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.absorb_challenge(&response);
        }
        Ok(response)
    }

    /// Make sure a challenge is cached by issuing a cheap authenticated GET.
    pub async fn prime(&self, probe_url: &str) -> AdapterResult<()> {
        let response = self.send(Method::GET, probe_url, |r| r).await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AdapterError::Connection(
                "digest authentication rejected".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Underlying client for requests that need no authentication.
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Build a request with the underlying client.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url)
    }
}

fn request_uri(url: &str) -> AdapterResult<String> {
    let parsed = Url::parse(url)
        .map_err(|e| AdapterError::Configuration(format!("invalid URL {}: {}", url, e)))?;
    Ok(match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = Challenge::parse(
            r#"Digest realm="Printer API", nonce="abc123", qop="auth,auth-int", opaque="xyz""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "Printer API");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
        assert!(challenge.qop_auth);

        assert!(Challenge::parse(r#"Basic realm="x""#).is_none());
        assert!(Challenge::parse(r#"Digest realm="x", nonce="n", algorithm=SHA-256"#).is_none());
    }

    #[test]
    fn test_rfc2617_example() {
        // Worked example from RFC 2617 section 3.5
        let challenge = Challenge {
            realm: "testrealm@host.com".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".to_string()),
            qop_auth: true,
        };
        let header = authorization(
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            &challenge,
            1,
            "0a4f113b",
        );
        assert!(header.contains(r#"response="6629fae49393a05397450978507c4ef1""#));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
    }

    #[test]
    fn test_request_uri_keeps_query() {
        assert_eq!(
            request_uri("http://mk4.local/api/v1/files/usb/a.gcode?x=1").unwrap(),
            "/api/v1/files/usb/a.gcode?x=1"
        );
    }
}
