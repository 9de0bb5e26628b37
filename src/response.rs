//! Immutable response wrapper returned by the fetcher.
//!
//! Text decoding is lazy. The body's encoding is resolved on first access
//! and cached. Resolution goes in this order:
//!
//! 1. the `charset` parameter of `Content-Type`, if it names a known encoding;
//! 2. UTF-8 for `application/json` (and `+json`) bodies;
//! 3. a byte order mark;
//! 4. UTF-8 if the body is valid UTF-8;
//! 5. a statistical guess from the body bytes;
//! 6. UTF-8 for an empty body.

use crate::error::{Result, SpiderError};
use bytes::Bytes;
use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use url::Url;

#[derive(Debug, Clone)]
pub struct Response {
    method: Method,
    url: Url,
    status: u16,
    content: Bytes,
    headers: Vec<(String, String)>,
    cookies: BTreeMap<String, String>,
    host: Option<String>,
    history: Vec<Url>,
    encoding: OnceLock<&'static Encoding>,
}

impl Response {
    pub fn new(url: Url, status: u16, content: impl Into<Bytes>) -> Self {
        let host = url.host_str().map(str::to_string);
        Self {
            method: Method::GET,
            url,
            status,
            content: content.into(),
            headers: Vec::new(),
            cookies: BTreeMap::new(),
            host,
            history: Vec::new(),
            encoding: OnceLock::new(),
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self.encoding = OnceLock::new();
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_history(mut self, history: Vec<Url>) -> Self {
        self.history = history;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header value under `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// URLs visited before the final one, oldest first.
    pub fn history(&self) -> &[Url] {
        &self.history
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding.get_or_init(|| self.detect_encoding())
    }

    fn detect_encoding(&self) -> &'static Encoding {
        if let Some(mime) = self
            .header("content-type")
            .and_then(|ct| ct.parse::<mime::Mime>().ok())
        {
            if let Some(encoding) = mime
                .get_param(mime::CHARSET)
                .and_then(|charset| Encoding::for_label(charset.as_str().as_bytes()))
            {
                return encoding;
            }
            if mime.type_() == mime::APPLICATION
                && (mime.subtype() == mime::JSON || mime.suffix() == Some(mime::JSON))
            {
                return UTF_8;
            }
        }
        if let Some((encoding, _)) = Encoding::for_bom(&self.content) {
            return encoding;
        }
        if self.content.is_empty() || std::str::from_utf8(&self.content).is_ok() {
            return UTF_8;
        }
        let mut detector = EncodingDetector::new();
        detector.feed(&self.content, true);
        detector.guess(None, true)
    }

    /// Decodes the body with the resolved encoding, failing on malformed input.
    pub fn text(&self) -> Result<String> {
        decode_strict(self.encoding(), &self.content)
    }

    /// Decodes the body with an explicitly named encoding.
    pub fn text_with(&self, label: &str) -> Result<String> {
        let encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| SpiderError::GeneralError(format!("unknown encoding '{}'", label)))?;
        decode_strict(encoding, &self.content)
    }

    /// Decodes the body, replacing malformed sequences.
    pub fn text_lossy(&self) -> String {
        let (text, _) = self.encoding().decode_with_bom_removal(&self.content);
        text.into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.text()?)?)
    }
}

fn decode_strict(encoding: &'static Encoding, bytes: &[u8]) -> Result<String> {
    let body = match Encoding::for_bom(bytes) {
        Some((bom_encoding, len)) if bom_encoding == encoding => &bytes[len..],
        _ => bytes,
    };
    encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .map(|text| text.into_owned())
        .ok_or(SpiderError::Decode(encoding.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn response(content: &'static [u8]) -> Response {
        Response::new(Url::parse("https://example.com/page").unwrap(), 200, content)
    }

    #[test]
    fn charset_header_wins() {
        let r = response(b"hello").with_header("Content-Type", "text/plain; charset=utf-8");
        assert_eq!(r.text().unwrap(), "hello");
        assert_eq!(r.encoding(), UTF_8);

        let r = response(b"caf\xe9").with_header("content-type", "text/html; charset=ISO-8859-1");
        assert_eq!(r.encoding().name(), "windows-1252");
        assert_eq!(r.text().unwrap(), "café");
    }

    #[test]
    fn missing_charset_falls_back_to_sniffing_then_utf8() {
        let r = response(b"hello").with_header("Content-Type", "text/plain");
        assert_eq!(r.encoding(), UTF_8);
        assert_eq!(r.text().unwrap(), "hello");

        assert_eq!(response(b"").encoding(), UTF_8);

        let r = response(b"\xef\xbb\xbfbom");
        assert_eq!(r.text().unwrap(), "bom");

        let r = response(b"Le caf\xe9 est tr\xe8s bon, la cr\xe8me br\xfbl\xe9e aussi.");
        assert_ne!(r.encoding(), UTF_8);
        assert!(r.text_lossy().starts_with("Le caf"));
    }

    #[test]
    fn strict_decoding_reports_malformed_bodies() {
        let r = response(b"\xff\xfe\xfd").with_header("Content-Type", "text/plain; charset=utf-8");
        assert!(matches!(r.text(), Err(SpiderError::Decode("UTF-8"))));
        assert_eq!(r.text_lossy(), "\u{fffd}\u{fffd}\u{fffd}");
        assert!(r.text_with("latin1").is_ok());
        assert!(r.text_with("no-such-encoding").is_err());
    }

    #[test]
    fn json_bodies() {
        let r = response(br#"{"items":[1,2]}"#).with_header("Content-Type", "application/json");
        let value: Value = r.json().unwrap();
        assert_eq!(value["items"][1], 2);
    }

    #[test]
    fn accessors() {
        let r = response(b"")
            .with_method(Method::HEAD)
            .with_cookie("sid", "abc")
            .with_history(vec![Url::parse("http://example.com/page").unwrap()]);
        assert_eq!(*r.method(), Method::HEAD);
        assert_eq!(r.host(), Some("example.com"));
        assert_eq!(r.cookies()["sid"], "abc");
        assert_eq!(r.history().len(), 1);
        assert!(r.is_success());
    }
}
