use serde::{Deserialize, Serialize};
use std::fmt;

/// Paths owned by the admin surface; endpoints may not shadow them.
pub const RESERVED_PATHS: &[&str] = &["/auth", "/add", "/delete", "/metrics"];

/// Methods accepted by the registration form.
pub const FORM_METHODS: &[&str] = &["GET", "POST", "DELETE"];

/// Length of generated endpoint paths (without the leading `/`).
const GENERATED_PATH_LEN: usize = 8;

/// Registry and persistence key for a `(path, method)` pair, rendered as
/// `"<METHOD> <path>"`. Method tokens never contain spaces, so distinct
/// pairs never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(String);

impl RouteId {
    pub fn new(path: &str, method: &str) -> Self {
        Self(format!("{} {}", method.trim().to_ascii_uppercase(), normalize_path(path)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// True when `path` (normalized) is the root, an admin path, or inside the
/// `/delete/` subtree the admin router claims.
pub fn is_reserved_path(path: &str) -> bool {
    path == "/" || RESERVED_PATHS.contains(&path) || path.starts_with("/delete/")
}

fn is_http_url(raw: &str) -> bool {
    url::Url::parse(raw).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

/// Ensure a single leading `/` and no trailing `/` (except for the root).
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{trimmed}")
}

/// A registered forwarding rule plus its runtime counters and cache slot.
///
/// Field names on the wire match the records persisted by earlier gateway
/// releases, so old stores hydrate unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub name: String,
    pub path: String,
    pub url: String,
    pub method: String,
    #[serde(rename = "cache")]
    pub cached_body: String,
    #[serde(rename = "enable-cache")]
    pub cache_enabled: bool,
    #[serde(rename = "enable-auth")]
    pub auth_enabled: bool,
    /// Requests allowed per window; `0` or negative means unlimited.
    #[serde(rename = "rate-limit")]
    pub rate_limit: i64,
    /// Unix seconds at which the current window began.
    #[serde(rename = "last-time")]
    pub window_start: i64,
    #[serde(rename = "requests")]
    pub request_count: u64,
    #[serde(rename = "total-requests")]
    pub total_requests: u64,
}

impl Endpoint {
    pub fn new(name: &str, path: &str, method: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            path: normalize_path(path),
            method: method.trim().to_ascii_uppercase(),
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub fn with_rate_limit(mut self, limit: i64) -> Self {
        self.rate_limit = limit;
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_auth(mut self, enabled: bool) -> Self {
        self.auth_enabled = enabled;
        self
    }

    pub fn route_id(&self) -> RouteId {
        RouteId::new(&self.path, &self.method)
    }

    pub fn is_limited(&self) -> bool {
        self.rate_limit > 0
    }

    /// Normalize path and method in place (config and store records may be
    /// written by hand).
    pub fn normalized(mut self) -> Self {
        self.path = normalize_path(&self.path);
        self.method = self.method.trim().to_ascii_uppercase();
        self
    }

    /// Apply the registration form's url, method and path rules to a
    /// normalized record built elsewhere (config files).
    pub fn validate(&self) -> Result<(), FormErrors> {
        let mut errors = FormErrors::default();
        if self.name.trim().is_empty() {
            errors.name = Some("Name cannot be empty.".into());
        }
        if !is_http_url(&self.url) {
            errors.url = Some("Url must be an absolute http(s) URL.".into());
        }
        if !FORM_METHODS.contains(&self.method.as_str()) {
            errors.method = Some("Method not allowed.".into());
        }
        if is_reserved_path(&self.path) {
            errors.path = Some("Path is reserved.".into());
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(())
    }
}

/// Field-keyed registration errors. Only failing fields are serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FormErrors {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(rename = "rate-limit", skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl FormErrors {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Raw `POST /add` fields before validation.
#[derive(Debug, Clone, Default)]
pub struct EndpointForm {
    pub name: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub rate_limit: Option<String>,
    pub enable_cache: Option<String>,
    pub enable_auth: Option<String>,
    pub path: Option<String>,
}

impl EndpointForm {
    /// Collect known fields from decoded form pairs; unknown keys are ignored
    /// and the last occurrence of a key wins.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut form = Self::default();
        for (k, v) in pairs {
            let slot = match k.as_ref() {
                "name" => &mut form.name,
                "url" => &mut form.url,
                "method" => &mut form.method,
                "rate-limit" => &mut form.rate_limit,
                "enable-cache" => &mut form.enable_cache,
                "enable-auth" => &mut form.enable_auth,
                "path" => &mut form.path,
                _ => continue,
            };
            *slot = Some(v.into());
        }
        form
    }

    /// Validate and build a fresh endpoint (empty counters and cache slot).
    pub fn into_endpoint(self) -> Result<Endpoint, FormErrors> {
        let mut errors = FormErrors::default();

        let name = non_empty(self.name);
        if name.is_none() {
            errors.name = Some("Name cannot be empty.".into());
        }

        let url = non_empty(self.url);
        match &url {
            None => errors.url = Some("Url cannot be empty.".into()),
            Some(u) if !is_http_url(u) => {
                errors.url = Some("Url must be an absolute http(s) URL.".into())
            }
            Some(_) => {}
        }

        let method = non_empty(self.method).map(|m| m.to_ascii_uppercase());
        match &method {
            None => errors.method = Some("Method cannot be empty.".into()),
            Some(m) if !FORM_METHODS.contains(&m.as_str()) => {
                errors.method = Some("Method not allowed.".into())
            }
            Some(_) => {}
        }

        let rate_limit = match non_empty(self.rate_limit) {
            None => 0,
            Some(raw) => raw.parse::<i64>().unwrap_or_else(|_| {
                errors.rate_limit = Some("Rate limit must be an integer.".into());
                0
            }),
        };

        let path = match non_empty(self.path) {
            Some(p) => {
                let p = normalize_path(&p);
                if is_reserved_path(&p) {
                    errors.path = Some("Path is reserved.".into());
                }
                p
            }
            None => format!("/{}", apy_crypto::random_alphanumeric(GENERATED_PATH_LEN)),
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Endpoint::new(
            &name.unwrap_or_default(),
            &path,
            &method.unwrap_or_default(),
            &url.unwrap_or_default(),
        )
        .with_rate_limit(rate_limit)
        .with_cache(flag(self.enable_cache))
        .with_auth(flag(self.enable_auth)))
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

// Checkbox semantics: present means on, unless spelled as an explicit "off".
fn flag(v: Option<String>) -> bool {
    match non_empty(v) {
        None => false,
        Some(s) => !matches!(s.to_ascii_lowercase().as_str(), "false" | "0" | "off" | "no"),
    }
}
