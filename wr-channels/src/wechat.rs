use crate::error::ChannelError;
use crate::traits::ChannelAdapter;
use crate::types::OutboundMessage;
use anyhow::{Result, anyhow};
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_API_BASE_URL: &str = "https://api.weixin.qq.com";

const WECHAT_CHANNEL_ID: &str = "wechat";
const WECHAT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);
const TOKEN_MIN_LIFETIME: Duration = Duration::from_secs(1);
const TOKEN_RETRY_BASE_MS: u64 = 250;
const TOKEN_RETRY_MAX_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct WeChatCredentials {
    pub app_id: String,
    pub app_secret: String,
}

/// A downloaded inbound picture.
#[derive(Debug, Clone)]
pub struct Picture {
    /// `Content-Type` without parameters, lowercased.
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Platform access token shared by every clone of the adapter.
///
/// A stored token is served until `expires_in` minus [`TOKEN_REFRESH_MARGIN`] has
/// elapsed; concurrent stores are last-writer-wins.
#[derive(Debug, Clone, Default)]
struct AccessTokenCache {
    slot: Arc<RwLock<Option<CachedToken>>>,
}

impl AccessTokenCache {
    /// The cached token, unless it is missing or due for refresh.
    async fn fresh(&self) -> Option<String> {
        self.slot
            .read()
            .await
            .as_ref()
            .filter(|cached| Instant::now() < cached.refresh_at)
            .map(|cached| cached.value.clone())
    }

    /// Cache `value` and return how long it will be served.
    async fn store(&self, value: String, expires_in: Duration) -> Duration {
        let lifetime = expires_in
            .saturating_sub(TOKEN_REFRESH_MARGIN)
            .max(TOKEN_MIN_LIFETIME);
        *self.slot.write().await = Some(CachedToken {
            value,
            refresh_at: Instant::now() + lifetime,
        });
        lifetime
    }
}

#[derive(Clone)]
pub struct WeChatAdapter {
    http: reqwest::Client,
    api_base_url: String,
    credentials: Option<WeChatCredentials>,
    token: AccessTokenCache,
}

impl WeChatAdapter {
    pub fn new(api_base_url: &str) -> Result<Self> {
        let api_base_url = api_base_url.trim().trim_end_matches('/');
        if api_base_url.is_empty() {
            return Err(anyhow!("wechat api base url is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(WECHAT_HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_base_url: api_base_url.to_string(),
            credentials: None,
            token: AccessTokenCache::default(),
        })
    }

    pub fn with_credentials(mut self, credentials: Option<WeChatCredentials>) -> Self {
        self.credentials = credentials.filter(|c| {
            !c.app_id.trim().is_empty() && !c.app_secret.trim().is_empty()
        });
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}{}", self.api_base_url, path))
            .map_err(|e| anyhow!("invalid wechat api url for {path}: {e}"))
    }

    /// Fetch an inbound picture from the platform media server.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn download_picture(&self, url: &str) -> std::result::Result<Picture, ChannelError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ChannelError::Download(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Download(format!("status={status} url={url}")));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChannelError::Download(e.to_string()))?;
        tracing::debug!(?content_type, size = bytes.len(), "picture downloaded");
        Ok(Picture {
            content_type,
            bytes: bytes.to_vec(),
        })
    }

    /// Current API access token, fetched on demand when missing or near expiry.
    pub async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.token.fresh().await {
            return Ok(token);
        }
        self.refresh_access_token().await?;
        self.token
            .fresh()
            .await
            .ok_or_else(|| anyhow!("wechat access token unavailable after refresh"))
    }

    /// Fetch a fresh token and return how long until it should be refreshed again.
    #[tracing::instrument(level = "info", skip_all)]
    async fn refresh_access_token(&self) -> Result<Duration> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| anyhow!("wechat app_id/app_secret are not configured"))?;
        let url = self.api_url("/cgi-bin/token")?;
        let response = self
            .http
            .get(url)
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", credentials.app_id.as_str()),
                ("secret", credentials.app_secret.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("wechat token request failed: status={status} body={body}"));
        }
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("wechat token response parse failed: {e} body={body}"))?;
        let Some(value) = parsed.access_token.filter(|t| !t.is_empty()) else {
            return Err(anyhow!(
                "wechat token request rejected: errcode={} errmsg={}",
                parsed.errcode.unwrap_or_default(),
                parsed.errmsg.unwrap_or_default()
            ));
        };

        let lifetime = self
            .token
            .store(value, Duration::from_secs(parsed.expires_in.unwrap_or(7200)))
            .await;
        tracing::info!(?lifetime, "wechat access token refreshed");
        Ok(lifetime)
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_refresh_loop(&self, shutdown: CancellationToken) {
        let mut consecutive_failures: u32 = 0;
        loop {
            let delay = match self.refresh_access_token().await {
                Ok(lifetime) => {
                    consecutive_failures = 0;
                    lifetime
                }
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = token_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "wechat access token refresh failed; retrying with backoff"
                    );
                    delay
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("wechat token refresh loop stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WeChatAdapter {
    fn channel_id(&self) -> &str {
        WECHAT_CHANNEL_ID
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.has_credentials() {
            tracing::info!("wechat app credentials not configured; token refresh disabled");
            return Ok(());
        }
        let adapter = self.clone();
        tokio::spawn(async move {
            adapter.run_refresh_loop(shutdown).await;
        });
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let to = recipient_id.trim();
        if to.is_empty() {
            return Err(anyhow!("recipient_id (openid) is required"));
        }
        let text = message.content.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let token = self.access_token().await?;
        let url = self.api_url("/cgi-bin/message/custom/send")?;
        let payload = serde_json::json!({
            "touser": to,
            "msgtype": "text",
            "text": { "content": text },
        });
        let response = self
            .http
            .post(url)
            .query(&[("access_token", token.as_str())])
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("wechat send failed: status={status} body={body}"));
        }
        let parsed: ApiStatus = serde_json::from_str(&body).unwrap_or_default();
        if parsed.errcode != 0 {
            return Err(anyhow!(
                "wechat send rejected: errcode={} errmsg={}",
                parsed.errcode,
                parsed.errmsg
            ));
        }
        Ok(())
    }
}

fn token_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TOKEN_RETRY_BASE_MS * multiplier).min(TOKEN_RETRY_MAX_MS))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    errcode: Option<i64>,
    #[serde(default)]
    errmsg: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn adapter_for(server: &mockito::ServerGuard) -> WeChatAdapter {
        WeChatAdapter::new(&server.url())
            .expect("adapter")
            .with_credentials(Some(WeChatCredentials {
                app_id: "wx-app".to_string(),
                app_secret: "wx-secret".to_string(),
            }))
    }

    async fn token_mock(server: &mut mockito::ServerGuard, hits: usize) -> mockito::Mock {
        server
            .mock("GET", "/cgi-bin/token")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "client_credential".into()),
                Matcher::UrlEncoded("appid".into(), "wx-app".into()),
                Matcher::UrlEncoded("secret".into(), "wx-secret".into()),
            ]))
            .with_status(200)
            .with_body(json!({"access_token": "tok-1", "expires_in": 7200}).to_string())
            .expect(hits)
            .create_async()
            .await
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        assert_eq!(token_retry_delay(1).as_millis(), 250);
        assert_eq!(token_retry_delay(2).as_millis(), 500);
        assert_eq!(token_retry_delay(3).as_millis(), 1000);
        assert_eq!(token_retry_delay(20).as_millis(), 30000);
    }

    #[test]
    fn blank_credentials_are_ignored() {
        let adapter = WeChatAdapter::new(DEFAULT_API_BASE_URL)
            .expect("adapter")
            .with_credentials(Some(WeChatCredentials {
                app_id: " ".to_string(),
                app_secret: "secret".to_string(),
            }));
        assert!(!adapter.has_credentials());
    }

    #[tokio::test(start_paused = true)]
    async fn token_cache_serves_until_the_refresh_margin() {
        let cache = AccessTokenCache::default();
        assert_eq!(cache.fresh().await, None);

        let lifetime = cache
            .store("tok-1".to_string(), Duration::from_secs(7200))
            .await;
        assert_eq!(lifetime, Duration::from_secs(6900));

        let shared = cache.clone();
        tokio::time::advance(Duration::from_secs(6899)).await;
        assert_eq!(shared.fresh().await.as_deref(), Some("tok-1"));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(shared.fresh().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn short_lived_tokens_are_kept_for_the_minimum_lifetime() {
        let cache = AccessTokenCache::default();
        let lifetime = cache.store("tok-1".to_string(), Duration::from_secs(60)).await;
        assert_eq!(lifetime, TOKEN_MIN_LIFETIME);
        assert_eq!(cache.fresh().await.as_deref(), Some("tok-1"));

        cache.store("tok-2".to_string(), Duration::from_secs(7200)).await;
        assert_eq!(cache.fresh().await.as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn access_token_is_cached_until_near_expiry() {
        let mut server = mockito::Server::new_async().await;
        let mock = token_mock(&mut server, 1).await;
        let adapter = adapter_for(&server);

        assert_eq!(adapter.access_token().await.expect("token"), "tok-1");
        assert_eq!(adapter.access_token().await.expect("cached token"), "tok-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_token_request_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/cgi-bin/token")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"errcode": 40013, "errmsg": "invalid appid"}).to_string())
            .create_async()
            .await;
        let adapter = adapter_for(&server);

        let err = adapter.access_token().await.expect_err("rejected");
        assert!(err.to_string().contains("40013"), "{err}");
    }

    #[tokio::test]
    async fn send_posts_customer_service_text() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, 1).await;
        let send = server
            .mock("POST", "/cgi-bin/message/custom/send")
            .match_query(Matcher::UrlEncoded("access_token".into(), "tok-1".into()))
            .match_body(Matcher::PartialJson(json!({
                "touser": "o_user",
                "msgtype": "text",
                "text": {"content": "late answer"}
            })))
            .with_status(200)
            .with_body(json!({"errcode": 0, "errmsg": "ok"}).to_string())
            .expect(1)
            .create_async()
            .await;
        let adapter = adapter_for(&server);

        adapter
            .send(
                "o_user",
                OutboundMessage {
                    content: "late answer".to_string(),
                },
            )
            .await
            .expect("send succeeds");
        send.assert_async().await;
    }

    #[tokio::test]
    async fn send_surfaces_platform_errcode() {
        let mut server = mockito::Server::new_async().await;
        let _token = token_mock(&mut server, 1).await;
        let _send = server
            .mock("POST", "/cgi-bin/message/custom/send")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"errcode": 45015, "errmsg": "response out of time limit"}).to_string())
            .create_async()
            .await;
        let adapter = adapter_for(&server);

        let err = adapter
            .send(
                "o_user",
                OutboundMessage {
                    content: "late answer".to_string(),
                },
            )
            .await
            .expect_err("platform rejects");
        assert!(err.to_string().contains("45015"), "{err}");
    }

    #[tokio::test]
    async fn download_picture_reports_bytes_and_content_type() {
        let mut server = mockito::Server::new_async().await;
        let _pic = server
            .mock("GET", "/pic.png")
            .with_status(200)
            .with_header("content-type", "image/PNG; charset=binary")
            .with_body(vec![0x89, 0x50, 0x4e, 0x47])
            .create_async()
            .await;
        let _missing = server
            .mock("GET", "/missing.jpg")
            .with_status(404)
            .create_async()
            .await;
        let adapter = adapter_for(&server);

        let picture = adapter
            .download_picture(&format!("{}/pic.png", server.url()))
            .await
            .expect("download");
        assert_eq!(picture.content_type.as_deref(), Some("image/png"));
        assert_eq!(picture.bytes, vec![0x89, 0x50, 0x4e, 0x47]);

        let err = adapter
            .download_picture(&format!("{}/missing.jpg", server.url()))
            .await
            .expect_err("404");
        assert!(matches!(err, ChannelError::Download(_)));
    }

    #[tokio::test]
    async fn start_without_credentials_is_a_noop() {
        let adapter = WeChatAdapter::new(DEFAULT_API_BASE_URL).expect("adapter");
        adapter
            .start(CancellationToken::new())
            .await
            .expect("start succeeds");
        assert_eq!(adapter.channel_id(), "wechat");
    }
}
