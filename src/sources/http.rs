use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{FeedBackend, NetworkDegree, SourceError, SourceKind};
use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::filters::{FeedQuery, Geo};
use crate::models::EventItem;

const USER_AGENT: &str = "show-feed/0.1";
const REQUEST_TIMEOUT_SECS: u64 = 20;
const RELATIONSHIP_TABLE: &str = "user_event_relationships";
const INTERESTED: &str = "interested";

/// `FeedBackend` over a PostgREST-style HTTP API: feeds are RPC functions,
/// interest is a row in the relationships table.
pub struct HttpBackend {
    base_url: String,
    api_key: Option<String>,
    access_token: Option<String>,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct RelationshipRow {
    event_id: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .context("building http client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            access_token: None,
            client,
        })
    }

    pub fn from_config(config: &FeedConfig) -> anyhow::Result<Self> {
        Self::new(config.backend_url.clone(), config.backend_api_key.clone())
    }

    /// Token of the signed-in user; falls back to the API key when unset.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        Url::parse(&format!("{}/{}", self.base_url, path))
            .with_context(|| format!("invalid backend url for {path}"))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request;
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }
        match self.access_token.as_ref().or(self.api_key.as_ref()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> anyhow::Result<String> {
        let response = self.authorize(request).send().await.context("request failed")?;
        let status = response.status();
        let body = response.text().await.context("unable to read response body")?;
        if !status.is_success() {
            return Err(anyhow!("status {status}: {body}"));
        }
        Ok(body)
    }

    async fn rpc<T: DeserializeOwned>(&self, function: &str, args: Value) -> anyhow::Result<T> {
        let url = self.url(&format!("rpc/{function}"))?;
        debug!(function, "calling backend rpc");
        let body = self.send(self.client.post(url).json(&args)).await?;
        serde_json::from_str(&body).with_context(|| format!("decoding {function} response"))
    }

    async fn events(
        &self,
        kind: SourceKind,
        function: &str,
        args: Value,
    ) -> Result<Vec<EventItem>, SourceError> {
        self.rpc::<Vec<EventItem>>(function, args)
            .await
            .map_err(|err| classify(kind, err))
    }
}

fn classify(kind: SourceKind, err: anyhow::Error) -> SourceError {
    let message = format!("{err:#}");
    if err.downcast_ref::<serde_json::Error>().is_some() {
        SourceError::Decode { kind, message }
    } else {
        SourceError::Unavailable { kind, message }
    }
}

#[async_trait]
impl FeedBackend for HttpBackend {
    async fn fetch_recommended_events(
        &self,
        user_id: &str,
        query: &FeedQuery,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<EventItem>, SourceError> {
        let args = json!({
            "p_user_id": user_id,
            "p_filters": query,
            "p_limit": page_size,
            "p_offset": page * page_size,
        });
        self.events(SourceKind::Recommended, "get_recommended_events", args)
            .await
    }

    async fn fetch_trending_events(
        &self,
        user_id: &str,
        geo: Option<Geo>,
        radius_miles: u32,
        limit: usize,
        city: Option<&str>,
    ) -> Result<Vec<EventItem>, SourceError> {
        let args = json!({
            "p_user_id": user_id,
            "p_lat": geo.map(|g| g.latitude),
            "p_lng": geo.map(|g| g.longitude),
            "p_radius_miles": radius_miles,
            "p_limit": limit,
            "p_city": city,
        });
        self.events(SourceKind::Trending, "get_trending_events", args)
            .await
    }

    async fn fetch_network_events(
        &self,
        user_id: &str,
        degree: NetworkDegree,
        limit: usize,
    ) -> Result<Vec<EventItem>, SourceError> {
        let args = json!({
            "p_user_id": user_id,
            "p_degree": degree as u8,
            "p_limit": limit,
        });
        self.events(SourceKind::Network, "get_network_events", args)
            .await
    }

    async fn fetch_following_events(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<EventItem>, SourceError> {
        let args = json!({
            "p_user_id": user_id,
            "p_limit": limit,
            "p_offset": offset,
        });
        self.events(SourceKind::Following, "get_following_events", args)
            .await
    }

    async fn set_event_interest(
        &self,
        user_id: &str,
        event_id: &str,
        interested: bool,
    ) -> Result<(), FeedError> {
        let url = self
            .url(RELATIONSHIP_TABLE)
            .map_err(|err| FeedError::Persistence(format!("{err:#}")))?;
        let request = if interested {
            self.client
                .post(url)
                .header("Prefer", "resolution=merge-duplicates")
                .json(&json!({
                    "user_id": user_id,
                    "event_id": event_id,
                    "relationship_type": INTERESTED,
                }))
        } else {
            self.client.delete(url).query(&[
                ("user_id", format!("eq.{user_id}")),
                ("event_id", format!("eq.{event_id}")),
                ("relationship_type", format!("eq.{INTERESTED}")),
            ])
        };
        self.send(request)
            .await
            .map(|_| ())
            .map_err(|err| FeedError::Persistence(format!("{err:#}")))
    }

    async fn get_user_interested_event_ids(
        &self,
        user_id: &str,
    ) -> Result<HashSet<String>, FeedError> {
        let lookup = async {
            let url = self.url(RELATIONSHIP_TABLE)?;
            let request = self.client.get(url).query(&[
                ("select", "event_id".to_string()),
                ("user_id", format!("eq.{user_id}")),
                ("relationship_type", format!("eq.{INTERESTED}")),
            ]);
            let body = self.send(request).await?;
            let rows: Vec<RelationshipRow> =
                serde_json::from_str(&body).context("decoding relationship rows")?;
            Ok::<HashSet<String>, anyhow::Error>(rows.into_iter().map(|row| row.event_id).collect())
        };
        lookup
            .await
            .map_err(|err| FeedError::Backend(format!("{err:#}")))
    }
}
