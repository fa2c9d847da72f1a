//! Captured request metadata
//!
//! A [`RequestRecord`] is built once per inbound request and never changes
//! afterwards. Its serialized field names form the on-disk store format.

use crate::browser;
use chrono::{DateTime, Local, TimeZone};
use hyper::header::{HeaderMap, USER_AGENT};
use hyper::Request;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Timestamp layout for `received`, e.g. `03-14-24 - 09:26`
pub const RECEIVED_FORMAT: &str = "%m-%d-%y - %H:%M";

/// Separator used when a header carries several values
const HEADER_VALUE_SEPARATOR: &str = ",";

/// Metadata describing one inbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    method: String,
    url: String,
    browser: String,
    #[serde(rename = "header")]
    headers: BTreeMap<String, String>,
    #[serde(rename = "ip")]
    client_address: String,
    #[serde(rename = "received")]
    received_at: String,
}

impl RequestRecord {
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        browser: impl Into<String>,
        headers: BTreeMap<String, String>,
        client_address: impl Into<String>,
        received_at: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            browser: browser.into(),
            headers,
            client_address: client_address.into(),
            received_at: received_at.into(),
        }
    }

    /// Capture a request as seen by the listener, stamped with the current local time
    pub fn from_request<B>(req: &Request<B>, client_addr: SocketAddr) -> Self {
        Self::from_request_at(req, client_addr, &Local::now())
    }

    /// Capture a request with an explicit receive time
    pub fn from_request_at<B, Tz>(
        req: &Request<B>,
        client_addr: SocketAddr,
        received: &DateTime<Tz>,
    ) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .map(|v| String::from_utf8_lossy(v.as_bytes()))
            .unwrap_or_default();

        Self {
            method: req.method().to_string(),
            url: req.uri().to_string(),
            browser: browser::classify(&user_agent).to_string(),
            headers: collapse_headers(req.headers()),
            client_address: client_addr.to_string(),
            received_at: format_received(received),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn browser(&self) -> &str {
        &self.browser
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn client_address(&self) -> &str {
        &self.client_address
    }

    pub fn received_at(&self) -> &str {
        &self.received_at
    }
}

/// Fold a header map into one string per name.
///
/// Repeated headers are joined with `,`, so the individual values cannot be
/// recovered afterwards.
pub fn collapse_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut collapsed = BTreeMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(HEADER_VALUE_SEPARATOR);
        collapsed.insert(name.as_str().to_string(), joined);
    }
    collapsed
}

pub fn format_received<Tz>(received: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    received.format(RECEIVED_FORMAT).to_string()
}
