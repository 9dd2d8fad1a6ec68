use std::sync::Arc;

use dashmap::DashMap;
use reqwest::{StatusCode, header::AUTHORIZATION};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    common::{
        errors::{LinkError, LinkResult},
        http::HttpClient,
    },
    configs::RestConfig,
    rest::{
        ratelimit::{HEADER_BUCKET, RateLimitHeaders, RateLimiter},
        route::Route,
    },
};

/// Response of `GET /gateway/bot`.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    pub shards: u32,
}

/// REST client that routes every call through its bucket's [`RateLimiter`].
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    /// route key -> server bucket id
    routes: DashMap<String, String>,
    /// bucket id (or provisional route key) -> limiter
    limiters: DashMap<String, Arc<RateLimiter>>,
    cancel: CancellationToken,
}

impl RestClient {
    pub fn new(config: &RestConfig, token: impl Into<String>) -> LinkResult<Self> {
        Ok(Self {
            http: HttpClient::new(config.timeout())?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            routes: DashMap::new(),
            limiters: DashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Aborts every queued or waiting request.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn gateway_bot(&self) -> LinkResult<GatewayBot> {
        let value = self.request(&Route::get("/gateway/bot"), None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn request(&self, route: &Route, body: Option<&Value>) -> LinkResult<Value> {
        let limiter = self.limiter_for(route);
        let url = format!("{}{}", self.base_url, route.path());
        let authorization = format!("Bot {}", self.token);

        let response = limiter
            .perform(
                || {
                    let mut request = self
                        .http
                        .request(route.method().clone(), &url)
                        .header(AUTHORIZATION, &authorization);
                    if !route.query_pairs().is_empty() {
                        request = request.query(route.query_pairs());
                    }
                    if let Some(body) = body {
                        request = request.json(body);
                    }
                    async move { request.send().await.map_err(LinkError::from) }
                },
                &self.cancel,
            )
            .await?;

        if let Some(bucket_id) = response.header_value(HEADER_BUCKET).map(str::to_owned) {
            self.adopt(route, &bucket_id, &limiter).await;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LinkError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn limiter_for(&self, route: &Route) -> Arc<RateLimiter> {
        let key = route.key();
        let bucket_id = self.routes.get(&key).map(|b| b.value().clone());
        if let Some(limiter) = bucket_id.and_then(|id| self.limiters.get(&id).map(|l| l.clone())) {
            return limiter;
        }
        self.limiters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RateLimiter::new(key)))
            .clone()
    }

    /// Binds `route` to the bucket the server reported. The first limiter to
    /// see a bucket becomes that bucket's limiter.
    async fn adopt(&self, route: &Route, bucket_id: &str, limiter: &Arc<RateLimiter>) {
        let key = route.key();
        if self.routes.get(&key).is_some_and(|b| b.value() == bucket_id) {
            return;
        }
        self.routes.insert(key.clone(), bucket_id.to_string());

        let owner = self
            .limiters
            .entry(bucket_id.to_string())
            .or_insert_with(|| limiter.clone())
            .clone();
        if Arc::ptr_eq(&owner, limiter) {
            limiter.rename(bucket_id).await;
        }
        if key != bucket_id {
            self.limiters.remove_if(&key, |_, l| Arc::ptr_eq(l, limiter));
        }
        debug!("route {} mapped to bucket {}", key, bucket_id);
    }
}
