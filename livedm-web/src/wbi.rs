//! wbi request signing.
//!
//! The signing key is derived from two image URLs returned by the account
//! nav endpoint and cached for [`WBI_KEY_TTL`]. A [`WbiSigner`] belongs to
//! whoever owns the HTTP client; share it through an `Arc`.

use crate::error::WebError;
use crate::http::read_json;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Account nav endpoint carrying the wbi image URLs.
pub const DEFAULT_NAV_URL: &str = "https://api.bilibili.com/x/web-interface/nav";

/// Lifetime of a derived key.
pub const WBI_KEY_TTL: Duration = Duration::from_secs(11 * 3600 + 59 * 60 + 30);

/// Positions in `img_key + sub_key` that make up the signing key.
pub const WBI_KEY_INDEX_TABLE: [usize; 32] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13,
];

/// Characters removed from every value before signing.
const FILTERED_CHARS: &[char] = &['!', '\'', '(', ')', '*'];

/// Form-urlencoding set: everything but `A-Z a-z 0-9 - _ . ~`.
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub const WTS: &str = "wts";
pub const W_RID: &str = "w_rid";

/// Ordered query parameters.
pub type Params = Vec<(String, String)>;

/// Returns the file stem of a URL: after the last `/`, before the first `.`.
pub fn extract_key_part(url: &str) -> &str {
    let name = url.rsplit_once('/').map_or(url, |(_, name)| name);
    name.split_once('.').map_or(name, |(stem, _)| stem)
}

/// Derives the 32-character signing key.
pub fn mixin_key(img_key: &str, sub_key: &str) -> String {
    let source: Vec<char> = img_key.chars().chain(sub_key.chars()).collect();
    WBI_KEY_INDEX_TABLE
        .iter()
        .filter_map(|&index| source.get(index))
        .collect()
}

fn form_encode(s: &str) -> String {
    utf8_percent_encode(s, QUERY_ENCODE_SET)
        .to_string()
        .replace("%20", "+")
}

/// The query string that gets hashed: filtered values plus `wts`, sorted by key.
pub fn string_to_sign(params: &[(String, String)], wts: i64) -> String {
    let mut sorted: BTreeMap<&str, String> = params
        .iter()
        .map(|(key, value)| (key.as_str(), value.replace(FILTERED_CHARS, "")))
        .collect();
    sorted.insert(WTS, wts.to_string());

    sorted
        .iter()
        .map(|(key, value)| format!("{}={}", form_encode(key), form_encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Signs `params` with `key` at unix time `wts`. The returned parameters are
/// the originals followed by `wts` and `w_rid`.
pub fn sign_params(params: &[(String, String)], key: &str, wts: i64) -> Params {
    let content = string_to_sign(params, wts);
    let w_rid = format!("{:x}", md5::compute(format!("{content}{key}")));

    let mut signed: Params = params
        .iter()
        .filter(|(k, _)| k != WTS && k != W_RID)
        .cloned()
        .collect();
    signed.push((WTS.to_string(), wts.to_string()));
    signed.push((W_RID.to_string(), w_rid));
    signed
}

/// A derived key and when it was fetched.
#[derive(Debug, Clone)]
pub struct WbiKeyCache {
    pub key: String,
    pub fetched_at: Instant,
}

impl WbiKeyCache {
    pub fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() >= WBI_KEY_TTL
    }
}

#[derive(Debug, Deserialize)]
struct NavResponse {
    data: Option<NavData>,
}

#[derive(Debug, Deserialize)]
struct NavData {
    wbi_img: Option<WbiImg>,
}

#[derive(Debug, Deserialize)]
struct WbiImg {
    img_url: String,
    sub_url: String,
}

/// A key fetch awaited by every caller that asked for a refresh while it ran.
type KeyFetch = Shared<BoxFuture<'static, Result<String, Arc<WebError>>>>;

/// Signs bootstrap requests, fetching and caching the key on demand.
pub struct WbiSigner {
    http: reqwest::Client,
    nav_url: String,
    cache: Arc<RwLock<Option<WbiKeyCache>>>,
    inflight: Arc<Mutex<Option<KeyFetch>>>,
}

impl fmt::Debug for WbiSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WbiSigner")
            .field("nav_url", &self.nav_url)
            .field("cache", &*self.cache.read())
            .field("refreshing", &self.inflight.lock().is_some())
            .finish()
    }
}

impl WbiSigner {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_nav_url(http, DEFAULT_NAV_URL)
    }

    pub fn with_nav_url(http: reqwest::Client, nav_url: impl Into<String>) -> Self {
        Self {
            http,
            nav_url: nav_url.into(),
            cache: Arc::new(RwLock::new(None)),
            inflight: Arc::new(Mutex::new(None)),
        }
    }

    /// The cached key, even if expired.
    pub fn key(&self) -> Option<String> {
        self.cache.read().as_ref().map(|cache| cache.key.clone())
    }

    pub fn needs_refresh(&self) -> bool {
        self.cache.read().as_ref().map_or(true, WbiKeyCache::is_expired)
    }

    /// Drops the cached key, e.g. after the server rejected a signature.
    pub fn reset(&self) {
        *self.cache.write() = None;
    }

    /// Fetches a new key unless the cached one is still fresh.
    ///
    /// Concurrent callers share one fetch and all get its outcome, failure
    /// included. The next call after the fetch settles starts a new one.
    pub async fn refresh(&self) -> Result<String, WebError> {
        if let Some(cache) = self.cache.read().as_ref() {
            if !cache.is_expired() {
                return Ok(cache.key.clone());
            }
        }

        let fetch = {
            let mut inflight = self.inflight.lock();
            match inflight.as_ref() {
                Some(fetch) => fetch.clone(),
                None => {
                    let fetch = self.start_fetch();
                    *inflight = Some(fetch.clone());
                    fetch
                }
            }
        };
        fetch.await.map_err(WebError::KeyFetch)
    }

    fn start_fetch(&self) -> KeyFetch {
        let http = self.http.clone();
        let nav_url = self.nav_url.clone();
        let cache = self.cache.clone();
        let inflight = self.inflight.clone();

        async move {
            let result = fetch_key(&http, &nav_url).await;
            if let Ok(key) = &result {
                *cache.write() = Some(WbiKeyCache {
                    key: key.clone(),
                    fetched_at: Instant::now(),
                });
                tracing::debug!("Refreshed wbi key");
            }
            inflight.lock().take();
            result.map_err(Arc::new)
        }
        .boxed()
        .shared()
    }

    /// A usable key: the cached one when fresh, a refreshed one otherwise,
    /// falling back to a stale one when the refresh fails.
    pub async fn ensure_key(&self) -> Option<String> {
        if !self.needs_refresh() {
            return self.key();
        }
        match self.refresh().await {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!("Failed to refresh wbi key: {}", e);
                self.key()
            }
        }
    }

    /// Signs `params` at the current time. Without a key the parameters are
    /// returned unsigned.
    pub async fn signed_params(&self, params: Params) -> Params {
        match self.ensure_key().await {
            Some(key) => sign_params(&params, &key, chrono::Utc::now().timestamp()),
            None => {
                tracing::warn!("No wbi key, sending unsigned request");
                params
            }
        }
    }
}

async fn fetch_key(http: &reqwest::Client, nav_url: &str) -> Result<String, WebError> {
    let response = http.get(nav_url).send().await?;
    // The nav endpoint answers -101 when logged out but still carries
    // the image URLs, so the code is not checked.
    let nav: NavResponse = read_json(response).await?;
    let wbi_img = nav
        .data
        .and_then(|data| data.wbi_img)
        .ok_or_else(|| WebError::Parse("missing data.wbi_img".to_string()))?;

    let img_key = extract_key_part(&wbi_img.img_url);
    let sub_key = extract_key_part(&wbi_img.sub_url);
    if img_key.is_empty() || sub_key.is_empty() {
        return Err(WebError::NoWbiKey);
    }
    Ok(mixin_key(img_key, sub_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const IMG_URL: &str = "https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png";
    const SUB_URL: &str = "https://i0.hdslb.com/bfs/wbi/4932caff0ff746eab6f01bf08b70ac45.png";
    const MIXIN_KEY: &str = "ea1db124af3c7062474693fa704f4ff8";

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn nav_body() -> serde_json::Value {
        json!({
            "code": -101,
            "message": "账号未登录",
            "data": {
                "isLogin": false,
                "wbi_img": { "img_url": IMG_URL, "sub_url": SUB_URL }
            }
        })
    }

    #[test]
    fn test_extract_key_part() {
        assert_eq!(extract_key_part(IMG_URL), "7cd084941338484aae1ad9425b84077c");
        assert_eq!(extract_key_part("https://host/a/b.c.png"), "b");
        assert_eq!(extract_key_part("noslash"), "noslash");
        assert_eq!(extract_key_part("https://host/"), "");
    }

    #[test]
    fn test_mixin_key() {
        let key = mixin_key(extract_key_part(IMG_URL), extract_key_part(SUB_URL));
        assert_eq!(key, MIXIN_KEY);
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn test_mixin_key_short_source() {
        // Indexes past the end are skipped.
        assert_eq!(mixin_key("abc", "").len(), 2);
    }

    #[test]
    fn test_string_to_sign() {
        let p = params(&[("foo", "114"), ("bar", "514"), ("zab", "1919810")]);
        assert_eq!(
            string_to_sign(&p, 1702204169),
            "bar=514&foo=114&wts=1702204169&zab=1919810"
        );

        let p = params(&[("q", "a b!'()*~c/d")]);
        assert_eq!(string_to_sign(&p, 1), "q=a+b~c%2Fd&wts=1");
    }

    #[test]
    fn test_sign_params_deterministic() {
        let p = params(&[("id", "21452505"), ("type", "0")]);
        let first = sign_params(&p, MIXIN_KEY, 1702204169);
        let second = sign_params(&p, MIXIN_KEY, 1702204169);
        assert_eq!(first, second);

        assert_eq!(&first[..2], &p[..]);
        assert_eq!(first[2], ("wts".to_string(), "1702204169".to_string()));
        let (name, w_rid) = &first[3];
        assert_eq!(name, "w_rid");
        assert_eq!(w_rid.len(), 32);

        let expected = format!(
            "{:x}",
            md5::compute(format!("id=21452505&type=0&wts=1702204169{MIXIN_KEY}"))
        );
        assert_eq!(w_rid, &expected);

        let changed = sign_params(
            &params(&[("id", "21452506"), ("type", "0")]),
            MIXIN_KEY,
            1702204169,
        );
        assert_ne!(changed[3].1, *w_rid);
    }

    #[test]
    fn test_cache_expiry() {
        let fresh = WbiKeyCache {
            key: MIXIN_KEY.to_string(),
            fetched_at: Instant::now(),
        };
        assert!(!fresh.is_expired());

        if let Some(fetched_at) = Instant::now().checked_sub(WBI_KEY_TTL) {
            let stale = WbiKeyCache {
                key: MIXIN_KEY.to_string(),
                fetched_at,
            };
            assert!(stale.is_expired());
        }
    }

    #[tokio::test]
    async fn test_refresh_is_single_flight() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/x/web-interface/nav"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_json(nav_body())
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let signer = Arc::new(WbiSigner::with_nav_url(
            reqwest::Client::new(),
            format!("{}/x/web-interface/nav", server.uri()),
        ));
        assert!(signer.needs_refresh());

        let (a, b, c) = tokio::join!(signer.ensure_key(), signer.ensure_key(), signer.ensure_key());
        assert_eq!(a.as_deref(), Some(MIXIN_KEY));
        assert_eq!(b, a);
        assert_eq!(c, a);
        assert!(!signer.needs_refresh());
    }

    #[tokio::test]
    async fn test_failed_refresh_is_shared() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/x/web-interface/nav"))
            .respond_with(
                wiremock::ResponseTemplate::new(500).set_delay(Duration::from_millis(100)),
            )
            .mount(&server)
            .await;

        let signer = WbiSigner::with_nav_url(
            reqwest::Client::new(),
            format!("{}/x/web-interface/nav", server.uri()),
        );

        let (a, b, c) = tokio::join!(signer.ensure_key(), signer.ensure_key(), signer.ensure_key());
        assert!(a.is_none() && b.is_none() && c.is_none());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);

        let err = signer.refresh().await.unwrap_err();
        let WebError::KeyFetch(cause) = err else {
            panic!("expected a key fetch error");
        };
        assert!(matches!(*cause, WebError::Status { status: 500, .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
        assert!(signer.needs_refresh());
    }

    #[tokio::test]
    async fn test_unsigned_when_key_unavailable() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let signer = WbiSigner::with_nav_url(reqwest::Client::new(), server.uri());
        let p = params(&[("id", "1")]);
        assert_eq!(signer.signed_params(p.clone()).await, p);
        assert!(signer.key().is_none());
    }

    #[tokio::test]
    async fn test_reset_forces_refetch() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(nav_body()))
            .expect(2)
            .mount(&server)
            .await;

        let signer = WbiSigner::with_nav_url(reqwest::Client::new(), server.uri());
        let signed = signer.signed_params(params(&[("id", "1")])).await;
        assert_eq!(signed.len(), 3);
        assert_eq!(signed[2].0, "w_rid");

        signer.reset();
        assert!(signer.needs_refresh());
        assert_eq!(signer.ensure_key().await.as_deref(), Some(MIXIN_KEY));
    }
}
