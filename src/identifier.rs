//! Caller identity for rate limiting keys.

use http::HeaderMap;

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const REAL_IP_HEADER: &str = "x-real-ip";
pub const UNKNOWN_IDENTIFIER: &str = "ip:unknown";

/// What the surrounding request layer knows about the caller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Authenticated principal id, when the caller is signed in
    pub principal_id: Option<String>,
    /// Raw `X-Forwarded-For` value
    pub forwarded_for: Option<String>,
    /// Raw `X-Real-IP` value
    pub real_ip: Option<String>,
}

impl RequestContext {
    /// Build a context from request headers; non UTF-8 values count as absent
    pub fn from_headers(principal_id: Option<&str>, headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };

        Self {
            principal_id: principal_id.map(str::to_owned),
            forwarded_for: header(FORWARDED_FOR_HEADER),
            real_ip: header(REAL_IP_HEADER),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Derive the rate limiting identifier for a caller.
///
/// A principal wins over any address, so one account is throttled as one
/// caller however many addresses it uses. Never fails: missing metadata
/// resolves to `ip:unknown`.
pub fn resolve(context: &RequestContext) -> String {
    if let Some(principal) = non_empty(context.principal_id.as_deref()) {
        return format!("user:{}", principal);
    }

    let forwarded = context
        .forwarded_for
        .as_deref()
        .and_then(|list| list.split(',').next());
    if let Some(address) = non_empty(forwarded) {
        return format!("ip:{}", address);
    }

    if let Some(address) = non_empty(context.real_ip.as_deref()) {
        return format!("ip:{}", address);
    }

    UNKNOWN_IDENTIFIER.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn context(principal: Option<&str>, forwarded: Option<&str>, real_ip: Option<&str>) -> RequestContext {
        RequestContext {
            principal_id: principal.map(str::to_owned),
            forwarded_for: forwarded.map(str::to_owned),
            real_ip: real_ip.map(str::to_owned),
        }
    }

    #[test]
    fn test_principal_takes_precedence() {
        let ctx = context(Some("42"), Some("203.0.113.5"), Some("10.0.0.1"));
        assert_eq!(resolve(&ctx), "user:42");
    }

    #[test]
    fn test_first_forwarded_address() {
        let ctx = context(None, Some(" 203.0.113.5 , 70.41.3.18, 150.172.238.178"), Some("10.0.0.1"));
        assert_eq!(resolve(&ctx), "ip:203.0.113.5");
    }

    #[test]
    fn test_real_ip_fallback() {
        let ctx = context(None, None, Some("10.0.0.1"));
        assert_eq!(resolve(&ctx), "ip:10.0.0.1");

        // An empty forwarded header does not hide the real address
        let ctx = context(None, Some(" , 1.2.3.4"), Some("10.0.0.1"));
        assert_eq!(resolve(&ctx), "ip:10.0.0.1");
    }

    #[test]
    fn test_unknown_sentinel() {
        assert_eq!(resolve(&RequestContext::default()), UNKNOWN_IDENTIFIER);
        assert_eq!(resolve(&context(Some("  "), Some(""), Some(" "))), UNKNOWN_IDENTIFIER);
    }

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", HeaderValue::from_static("198.51.100.7, 10.0.0.2"));
        headers.insert("X-Real-IP", HeaderValue::from_static("10.0.0.2"));

        let ctx = RequestContext::from_headers(None, &headers);
        assert_eq!(ctx.forwarded_for.as_deref(), Some("198.51.100.7, 10.0.0.2"));
        assert_eq!(resolve(&ctx), "ip:198.51.100.7");

        let ctx = RequestContext::from_headers(Some("7"), &headers);
        assert_eq!(resolve(&ctx), "user:7");
    }

    #[test]
    fn test_non_utf8_header_is_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap(),
        );

        let ctx = RequestContext::from_headers(None, &headers);
        assert!(ctx.forwarded_for.is_none());
        assert_eq!(resolve(&ctx), UNKNOWN_IDENTIFIER);
    }
}
