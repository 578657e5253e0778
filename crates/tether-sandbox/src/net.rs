/// Case-insensitive exact-host or dotted-suffix match against the
/// allow-list. Allowing `example.com` admits `api.example.com`; there are
/// no wildcards.
pub fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    allowed.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        if entry.is_empty() {
            return false;
        }
        host == entry || host.ends_with(&format!(".{entry}"))
    })
}

/// Extract the host portion of a URL-ish string without a full URL parser.
pub fn host_of_url(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let rest = rest.split(['/', '?', '#']).next()?;
    let rest = rest.rsplit_once('@').map(|(_, r)| r).unwrap_or(rest);
    let host = if let Some(stripped) = rest.strip_prefix('[') {
        // Bracketed IPv6 literal.
        stripped.split(']').next()?
    } else {
        rest.split(':').next()?
    };
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_and_suffix_match() {
        let list = allowed(&["example.com"]);
        assert!(host_allowed("example.com", &list));
        assert!(host_allowed("api.example.com", &list));
        assert!(host_allowed("API.Example.COM", &list));
        assert!(!host_allowed("badexample.com", &list));
        assert!(!host_allowed("example.com.evil.io", &list));
        assert!(!host_allowed("", &list));
    }

    #[test]
    fn url_host_extraction() {
        assert_eq!(host_of_url("https://api.example.com/v1").unwrap(), "api.example.com");
        assert_eq!(host_of_url("http://user:pw@example.com:8080/x").unwrap(), "example.com");
        assert_eq!(host_of_url("example.com/path").unwrap(), "example.com");
        assert_eq!(host_of_url("https://[::1]:443/").unwrap(), "::1");
    }
}
