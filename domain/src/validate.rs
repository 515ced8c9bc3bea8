//! Redirect target normalization.

use url::Url;

use crate::{CoreError, MAX_URL_LEN};

/// Schemes a short link may point at.
pub const ALLOWED_SCHEMES: [&str; 5] = ["http", "https", "magnet", "steam", "spotify"];

/// True for `host:port[/...]` input such as "example.com:8080/x" or
/// "localhost:3000". The host must contain a dot or be `localhost`, so
/// "sms:12345" or "tel:5551234" keep their scheme.
fn is_bare_host_port(raw: &str) -> bool {
    let Some((host, rest)) = raw.split_once(':') else {
        return false;
    };
    let port = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_ok = (host.contains('.') || host.eq_ignore_ascii_case("localhost"))
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-');
    host_ok && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
}

fn parse_lenient(raw: &str) -> Result<Url, CoreError> {
    let with_https = || {
        Url::parse(&format!("https://{raw}"))
            .map_err(|_| CoreError::InvalidUrl("invalid URL format".into()))
    };
    match Url::parse(raw) {
        // "example.com:8080/x" parses with scheme "example.com".
        Ok(u) if is_bare_host_port(raw) && !ALLOWED_SCHEMES.contains(&u.scheme()) => with_https(),
        Ok(u) => Ok(u),
        Err(_) => with_https(),
    }
}

/// Parse and normalize a redirect target.
///
/// Input that does not parse as an absolute URL is retried with `https://`
/// prepended. Only [`ALLOWED_SCHEMES`] are accepted. When `site_host` is set,
/// targets on that host (case-insensitive, port ignored) are rejected.
pub fn normalize_redirect(raw: &str, site_host: Option<&str>) -> Result<String, CoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidUrl("redirect_to is required".into()));
    }

    let url = parse_lenient(trimmed)?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(CoreError::DisallowedScheme(url.scheme().to_string()));
    }

    if let (Some(site), Some(host)) = (site_host, url.host_str()) {
        if host.eq_ignore_ascii_case(site) {
            return Err(CoreError::SelfReferential);
        }
    }

    let normalized = url.to_string();
    if normalized.len() > MAX_URL_LEN {
        return Err(CoreError::InvalidUrl("too long".into()));
    }
    Ok(normalized)
}

/// Extract the comparable host from a configured public site value, which
/// may be a bare host ("sho.rt") or a full URL ("https://sho.rt:8443/").
pub fn site_host_from_config(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = match Url::parse(trimmed) {
        Ok(u) if u.host_str().is_some() => Some(u),
        _ => Url::parse(&format!("https://{trimmed}")).ok(),
    };
    parsed
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepends_https_when_scheme_missing() {
        assert_eq!(
            normalize_redirect("example.com/page", None).unwrap(),
            "https://example.com/page"
        );
        assert_eq!(
            normalize_redirect("example.com:8080/x", None).unwrap(),
            "https://example.com:8080/x"
        );
        assert_eq!(
            normalize_redirect("localhost:3000", None).unwrap(),
            "https://localhost:3000/"
        );
    }

    #[test]
    fn accepts_allowed_schemes() {
        assert_eq!(
            normalize_redirect("http://example.com/a?b=c", None).unwrap(),
            "http://example.com/a?b=c"
        );
        assert!(normalize_redirect("magnet:?xt=urn:btih:abcdef", None).is_ok());
        assert!(normalize_redirect("steam://run/440", None).is_ok());
        assert!(normalize_redirect("spotify:track:4uLU6hMCjMI75M1A2tKUQC", None).is_ok());
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(
            normalize_redirect("ftp://example.com/file", None),
            Err(CoreError::DisallowedScheme(s)) if s == "ftp"
        ));
        for raw in [
            "javascript:alert(1)",
            "javascript:1",
            "mailto:someone@evil.com",
            "sms:12345",
            "tel:5551234",
            "data:text/html,hi",
            "file:///etc/passwd",
        ] {
            assert!(
                matches!(normalize_redirect(raw, None), Err(CoreError::DisallowedScheme(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn host_port_detection() {
        assert!(is_bare_host_port("example.com:8080"));
        assert!(is_bare_host_port("localhost:3000/x?y=1"));
        assert!(!is_bare_host_port("sms:12345"));
        assert!(!is_bare_host_port("mailto:a@b.com"));
        assert!(!is_bare_host_port("example.com:http"));
        assert!(!is_bare_host_port("example.com"));
    }

    #[test]
    fn rejects_empty_and_oversized() {
        assert!(matches!(normalize_redirect("  ", None), Err(CoreError::InvalidUrl(_))));
        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_LEN));
        assert!(matches!(normalize_redirect(&long, None), Err(CoreError::InvalidUrl(_))));
    }

    #[test]
    fn rejects_self_referential_host() {
        let site = Some("sho.rt");
        assert!(matches!(
            normalize_redirect("https://SHO.RT/abc", site),
            Err(CoreError::SelfReferential)
        ));
        assert!(matches!(
            normalize_redirect("sho.rt:8443/abc", site),
            Err(CoreError::SelfReferential)
        ));
        assert!(normalize_redirect("https://sub.sho.rt/abc", site).is_ok());
    }

    #[test]
    fn site_host_parsing() {
        assert_eq!(site_host_from_config("sho.rt").as_deref(), Some("sho.rt"));
        assert_eq!(
            site_host_from_config("https://Sho.Rt:8443/").as_deref(),
            Some("sho.rt")
        );
        assert_eq!(site_host_from_config(""), None);
    }
}
