//! The seam between the fetcher and the network.
//!
//! The fetcher only needs "perform one HTTP exchange": [`Transport::send`]
//! takes a fully processed [`Request`] and returns a [`Response`] carrying
//! status, body, headers, cookies, host and redirect history. Tests plug in a
//! stub; [`ReqwestTransport`] is the default implementation.

use crate::error::{Result, SpiderError};
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::SET_COOKIE;
use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::trace;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: Request) -> Result<Response>;
}

/// A [`Transport`] backed by `reqwest`, with one client per proxy.
pub struct ReqwestTransport {
    direct: Client,
    proxied: DashMap<String, Client>,
    default_timeout: Option<Duration>,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        Ok(Self {
            direct: build_client(None)?,
            proxied: DashMap::new(),
            default_timeout: None,
        })
    }

    /// Timeout applied to requests that do not set their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        if let Some(client) = self.proxied.get(proxy) {
            return Ok(client.clone());
        }
        let client = build_client(Some(proxy))?;
        self.proxied.insert(proxy.to_string(), client.clone());
        Ok(client)
    }
}

fn build_client(proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder();
    if let Some(proxy) = proxy {
        let proxy = Proxy::all(proxy)
            .map_err(|e| SpiderError::Transport(format!("invalid proxy '{}': {}", proxy, e)))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| SpiderError::Transport(e.to_string()))
}

fn map_error(url: &str, e: reqwest::Error) -> SpiderError {
    if e.is_timeout() {
        SpiderError::Timeout(url.to_string())
    } else {
        SpiderError::Transport(e.to_string())
    }
}

/// Extracts `name=value` from a `Set-Cookie` header value.
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().trim_matches('"').to_string()))
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        let client = self.client_for(request.proxy.as_deref())?;
        let requested = request.url.clone();
        let method = request.method.clone();

        let mut builder = client.request(method.clone(), requested.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout.or(self.default_timeout) {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        trace!("sending {} {}", method, requested);
        let resp = builder
            .send()
            .await
            .map_err(|e| map_error(requested.as_str(), e))?;

        let status = resp.status().as_u16();
        let final_url = resp.url().clone();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let cookies: Vec<(String, String)> = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        let content = resp
            .bytes()
            .await
            .map_err(|e| map_error(requested.as_str(), e))?;

        let history = if final_url != requested {
            vec![requested]
        } else {
            Vec::new()
        };
        let mut response = Response::new(final_url, status, content)
            .with_method(method)
            .with_history(history);
        for (name, value) in headers {
            response = response.with_header(name, value);
        }
        for (name, value) in cookies {
            response = response.with_cookie(name, value);
        }
        Ok(response)
    }
}
