//! Request cookies and `Set-Cookie` builders.
//!
//! # Example
//!
//! ```rust
//! use portico_core::cookie::{Cookies, SameSite, SetCookie};
//!
//! let cookies = Cookies::parse("session=abc123; theme=dark");
//! assert_eq!(cookies.get("theme"), Some("dark"));
//!
//! let cookie = SetCookie::new("session", "abc123")
//!     .http_only(true)
//!     .same_site(SameSite::Strict)
//!     .max_age_secs(3600);
//! assert_eq!(
//!     cookie.to_header_value(),
//!     "session=abc123; Max-Age=3600; HttpOnly; SameSite=Strict"
//! );
//! ```

use std::fmt;
use std::time::{Duration, SystemTime};

use http::header::{HeaderMap, COOKIE};
use indexmap::IndexMap;

/// Cookies sent by the client, in header order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookies {
    cookies: IndexMap<String, String>,
}

impl Cookies {
    /// Creates an empty cookie jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a `Cookie` header value. Pairs without `=` are skipped and a
    /// repeated name keeps its first value.
    pub fn parse(header_value: &str) -> Self {
        let mut cookies = IndexMap::new();
        for pair in header_value.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                let value = value.trim().trim_matches('"');
                cookies
                    .entry(name.to_string())
                    .or_insert_with(|| value.to_string());
            }
        }
        Self { cookies }
    }

    /// Collects the cookies of every `Cookie` header.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut jar = Self::new();
        for value in headers.get_all(COOKIE).iter().filter_map(|v| v.to_str().ok()) {
            for (name, value) in Self::parse(value).cookies {
                jar.cookies.entry(name).or_insert(value);
            }
        }
        jar
    }

    /// Returns a cookie value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Returns true if the cookie was sent.
    pub fn contains(&self, name: &str) -> bool {
        self.cookies.contains_key(name)
    }

    /// Iterates over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of cookies.
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// Returns true if no cookie was sent.
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    /// Sent with cross-site requests.
    None,
    /// Sent with same-site requests and top-level navigations.
    #[default]
    Lax,
    /// Sent with same-site requests only.
    Strict,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "None",
            Self::Lax => "Lax",
            Self::Strict => "Strict",
        })
    }
}

/// A cookie to set on the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    max_age: Option<Duration>,
    expires: Option<SystemTime>,
    secure: bool,
    http_only: bool,
    same_site: Option<SameSite>,
}

impl SetCookie {
    /// Creates a session cookie.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            max_age: None,
            expires: None,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    /// A cookie that deletes `name` on the client.
    pub fn removal(name: impl Into<String>) -> Self {
        Self::new(name, "")
            .max_age_secs(0)
            .expires(SystemTime::UNIX_EPOCH)
    }

    /// Sets the `Domain` attribute.
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Sets the `Path` attribute.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the `Max-Age` attribute.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Sets the `Max-Age` attribute in seconds.
    pub fn max_age_secs(self, seconds: u64) -> Self {
        self.max_age(Duration::from_secs(seconds))
    }

    /// Sets the `Expires` attribute.
    pub fn expires(mut self, at: SystemTime) -> Self {
        self.expires = Some(at);
        self
    }

    /// Sets the `Secure` attribute.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets the `HttpOnly` attribute.
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// Sets the `SameSite` attribute.
    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    /// Cookie name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cookie value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Renders the `Set-Cookie` header value.
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={}", max_age.as_secs()));
        }
        if let Some(expires) = self.expires {
            out.push_str("; Expires=");
            out.push_str(&httpdate::fmt_http_date(expires));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(same_site) = self.same_site {
            out.push_str(&format!("; SameSite={same_site}"));
        }
        out
    }
}

impl fmt::Display for SetCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header_value())
    }
}
