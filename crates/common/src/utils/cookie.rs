use http::header::{COOKIE, HeaderMap, HeaderValue, InvalidHeaderValue};
use sha2::{Digest, Sha256};

/// Value of the auth cookie: the lowercase hex SHA-256 of the shared secret
pub fn auth_cookie_value(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Add `name=value` to the request's cookies
///
/// Joins onto an existing `Cookie` header with `"; "` the way a browser sends
/// its cookie jar, so the upstream sees a single header.
pub fn append_cookie(
    headers: &mut HeaderMap,
    name: &str,
    value: &str,
) -> Result<(), InvalidHeaderValue> {
    let pair = format!("{}={}", name, value);

    let existing: Vec<&[u8]> = headers
        .get_all(COOKIE)
        .iter()
        .map(|v| v.as_bytes())
        .filter(|v| !v.is_empty())
        .collect();

    let joined = if existing.is_empty() {
        HeaderValue::from_str(&pair)?
    } else {
        let mut bytes = existing.join(&b"; "[..]);
        bytes.extend_from_slice(b"; ");
        bytes.extend_from_slice(pair.as_bytes());
        HeaderValue::from_bytes(&bytes)?
    };

    headers.insert(COOKIE, joined);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_cookie_value() {
        // sha256("secret")
        assert_eq!(
            auth_cookie_value("secret"),
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );

        let value = auth_cookie_value("");
        assert_eq!(value.len(), 64);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_append_cookie_without_existing() {
        let mut headers = HeaderMap::new();
        append_cookie(&mut headers, "key", "abc").unwrap();
        assert_eq!(headers.get(COOKIE).unwrap(), "key=abc");
    }

    #[test]
    fn test_append_cookie_joins_existing() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "session=1".parse().unwrap());
        headers.append(COOKIE, "theme=dark".parse().unwrap());

        append_cookie(&mut headers, "key", "abc").unwrap();

        let cookies: Vec<_> = headers.get_all(COOKIE).iter().collect();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0], "session=1; theme=dark; key=abc");
    }

    #[test]
    fn test_append_cookie_rejects_invalid_value() {
        let mut headers = HeaderMap::new();
        assert!(append_cookie(&mut headers, "key", "a\nb").is_err());
        assert!(headers.get(COOKIE).is_none());
    }
}
