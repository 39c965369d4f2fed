//! Impersonation headers (`Impersonate-User`, `Impersonate-Group`, `Impersonate-Extra-*`).

use std::sync::Arc;

use http::{header::HeaderName, HeaderValue, Request};
use tower::{Layer, Service};

use ranch_core::{ProxyError, ProxyResult, UserInfo};

/// Layer making every request act as one caller.
#[derive(Clone, Debug, Default)]
pub struct ImpersonateLayer {
    headers: Arc<Vec<(HeaderName, HeaderValue)>>,
}

/// Percent-escape everything outside the header token alphabet, as the API server
/// expects for extra keys.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.to_lowercase().bytes() {
        let safe = b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~' | b'!' | b'*' | b'\'');
        if safe {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

impl ImpersonateLayer {
    pub fn for_user(user: &UserInfo) -> ProxyResult<Self> {
        let value = |v: &str| {
            HeaderValue::from_str(v).map_err(|e| ProxyError::BadRequest(format!("invalid impersonation value {:?}: {}", v, e)))
        };
        let mut headers = vec![(HeaderName::from_static("impersonate-user"), value(user.name.as_str())?)];
        for group in &user.groups {
            headers.push((HeaderName::from_static("impersonate-group"), value(group.as_str())?));
        }
        for (key, values) in &user.extra {
            let name = HeaderName::from_bytes(format!("impersonate-extra-{}", escape_key(key)).as_bytes())
                .map_err(|e| ProxyError::BadRequest(format!("invalid extra key {:?}: {}", key, e)))?;
            for v in values {
                headers.push((name.clone(), value(v.as_str())?));
            }
        }
        Ok(Self { headers: Arc::new(headers) })
    }

    pub fn headers(&self) -> &[(HeaderName, HeaderValue)] {
        &self.headers
    }
}

impl<S> Layer<S> for ImpersonateLayer {
    type Service = Impersonate<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Impersonate { inner, headers: self.headers.clone() }
    }
}

#[derive(Clone)]
pub struct Impersonate<S> {
    inner: S,
    headers: Arc<Vec<(HeaderName, HeaderValue)>>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for Impersonate<S>
where
    S: Service<Request<ReqBody>>,
{
    type Error = S::Error;
    type Future = S::Future;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        for (name, value) in self.headers.iter() {
            req.headers_mut().append(name.clone(), value.clone());
        }
        self.inner.call(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_keys_are_lowercased_and_escaped() {
        assert_eq!(escape_key("Scopes"), "scopes");
        assert_eq!(escape_key("example.org/Role"), "example.org%2Frole");
        assert_eq!(escape_key("a b"), "a%20b");
    }

    #[test]
    fn one_header_per_group_and_value() {
        let user = UserInfo::new("bob")
            .with_groups(["devs", "system:authenticated"])
            .with_extra("principalid", vec!["local://u-1".into()])
            .with_extra("scopes", vec!["a".into(), "b".into()]);
        let layer = ImpersonateLayer::for_user(&user).unwrap();
        let names: Vec<_> = layer.headers().iter().map(|(n, v)| (n.as_str().to_string(), v.to_str().unwrap().to_string())).collect();
        assert_eq!(
            names,
            vec![
                ("impersonate-user".to_string(), "bob".to_string()),
                ("impersonate-group".to_string(), "devs".to_string()),
                ("impersonate-group".to_string(), "system:authenticated".to_string()),
                ("impersonate-extra-principalid".to_string(), "local://u-1".to_string()),
                ("impersonate-extra-scopes".to_string(), "a".to_string()),
                ("impersonate-extra-scopes".to_string(), "b".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_values_that_cannot_be_headers() {
        let user = UserInfo::new("bob").with_extra("k", vec!["line\nbreak".into()]);
        assert!(matches!(ImpersonateLayer::for_user(&user), Err(ProxyError::BadRequest(_))));
    }
}
