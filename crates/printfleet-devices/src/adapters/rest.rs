//! REST plumbing shared by the HTTP-speaking adapters.

use crate::adapter::{AdapterError, AdapterResult};
use crate::context::PrinterContext;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;
use std::sync::Arc;

/// Build the HTTP client used by one adapter.
pub fn http_client(ctx: &PrinterContext) -> AdapterResult<Client> {
    let connect_timeout = ctx.settings.read(|s| s.handshake_timeout());
    Ok(Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(concat!("printfleet/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// Percent-encode each segment of a storage path, keeping the slashes.
pub fn encode_path(path: &str) -> String {
    path.trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Split `a/b/c.gcode` into (`a/b`, `c.gcode`).
pub fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    }
}

/// Base URL of the printer without a trailing slash.
pub fn base_url(ctx: &PrinterContext) -> AdapterResult<String> {
    normalize_base(&ctx.login()?.printer_url)
}

/// Normalize a printer address into an `http(s)://host[:port]` base.
pub fn normalize_base(printer_url: &str) -> AdapterResult<String> {
    let base = printer_url.trim().trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        Ok(base.to_string())
    } else if base.contains("://") {
        Err(AdapterError::Configuration(format!("unsupported URL scheme: {}", base)))
    } else {
        Ok(format!("http://{}", base))
    }
}

/// JSON body of a response, or `Null` when the body is empty.
pub async fn json_body(response: Response) -> AdapterResult<Value> {
    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// REST client that sends the login's API key as `X-Api-Key`.
pub struct RestClient {
    ctx: Arc<PrinterContext>,
    http: Client,
}

impl RestClient {
    pub fn new(ctx: Arc<PrinterContext>) -> AdapterResult<Self> {
        let http = http_client(&ctx)?;
        Ok(Self { ctx, http })
    }

    pub fn url(&self, path: &str) -> AdapterResult<String> {
        Ok(format!("{}{}", base_url(&self.ctx)?, path))
    }

    /// Request bounded by the configured request timeout.
    pub fn request(&self, method: Method, path: &str) -> AdapterResult<RequestBuilder> {
        let timeout = self.ctx.settings.read(|s| s.request_timeout());
        Ok(self.transfer(method, path)?.timeout(timeout))
    }

    /// Request without a total timeout, for file transfers.
    pub fn transfer(&self, method: Method, path: &str) -> AdapterResult<RequestBuilder> {
        let mut builder = self.http.request(method, self.url(path)?);
        if let Some(key) = self.ctx.login()?.api_key {
            builder = builder.header("X-Api-Key", key);
        }
        Ok(builder)
    }

    /// Send and fail on non-success status.
    pub async fn send(&self, builder: RequestBuilder) -> AdapterResult<Response> {
        Ok(builder.send().await?.error_for_status()?)
    }

    pub async fn get_json(&self, path: &str) -> AdapterResult<Value> {
        let response = self.send(self.request(Method::GET, path)?).await?;
        json_body(response).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> AdapterResult<Value> {
        let response = self
            .send(self.request(Method::POST, path)?.json(body))
            .await?;
        json_body(response).await
    }

    pub async fn post_empty(&self, path: &str) -> AdapterResult<()> {
        self.send(self.request(Method::POST, path)?).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> AdapterResult<()> {
        self.send(self.request(Method::DELETE, path)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_path() {
        assert_eq!(encode_path("/prints/Benchy v2.gcode"), "prints/Benchy%20v2.gcode");
        assert_eq!(encode_path("a//b/"), "a/b");
    }

    #[test]
    fn test_normalize_base() {
        assert_eq!(normalize_base("octopi.local/").unwrap(), "http://octopi.local");
        assert_eq!(normalize_base("https://mk4:8080").unwrap(), "https://mk4:8080");
        assert!(normalize_base("ftp://mk4").is_err());
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("a/b/c.gcode"), ("a/b", "c.gcode"));
        assert_eq!(split_parent("c.gcode"), ("", "c.gcode"));
    }
}
