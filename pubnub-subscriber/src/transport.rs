//! HTTP transport for the subscribe, heartbeat, leave and time endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::state::PollSnapshot;
use crate::types::Error;

const PNSDK: &str = concat!("pubnub-subscriber-rs/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client for the service. Owns the connection pool, base URL and
/// client identity. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub(crate) struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    base_url: Url,
    subscribe_key: String,
    uuid: String,
    auth_key: Option<String>,
    filter_expression: Option<String>,
    presence_timeout: u32,
    subscribe_timeout: Duration,
    request_timeout: Duration,
}

impl Transport {
    pub(crate) fn new(config: &Config) -> Result<Self, Error> {
        let client = Client::builder()
            .connect_timeout(config.timing.connect_timeout)
            .build()?;
        let scheme = if config.secure { "https" } else { "http" };
        let base_url = Url::parse(&format!("{scheme}://{}/", config.origin))?;

        tracing::info!(
            origin = %config.origin,
            secure = config.secure,
            uuid = %config.uuid,
            "transport initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url,
                subscribe_key: config.subscribe_key.clone(),
                uuid: config.uuid.clone(),
                auth_key: config.auth_key.clone(),
                filter_expression: config.filter_expression.clone(),
                presence_timeout: config.presence_timeout,
                subscribe_timeout: config.timing.subscribe_request_timeout,
                request_timeout: config.timing.non_subscribe_request_timeout,
            }),
        })
    }

    pub(crate) fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    /// Issue one long-poll and return the raw response body.
    pub(crate) async fn subscribe(
        &self,
        request: &PollSnapshot,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let inner = &*self.inner;
        let mut url = self.url(&[
            "v2",
            "subscribe",
            &inner.subscribe_key,
            &channel_segment(&request.channels),
            "0",
        ]);
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("tt", &request.cursor.timetoken.to_string());
            if request.cursor.region != 0 {
                q.append_pair("tr", &request.cursor.region.to_string());
            }
            if !request.groups.is_empty() {
                q.append_pair("channel-group", &request.groups.join(","));
            }
            if inner.presence_timeout > 0 {
                q.append_pair("heartbeat", &inner.presence_timeout.to_string());
            }
            if let Some(filter) = inner.filter_expression.as_deref().filter(|f| !f.is_empty()) {
                q.append_pair("filter-expr", filter);
            }
            if !request.state.is_empty() {
                q.append_pair("state", &serde_json::to_string(&request.state)?);
            }
        }
        self.append_identity(&mut url);

        tracing::trace!(%url, "subscribe request");
        let response = self.execute(url, inner.subscribe_timeout, cancel).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            body = response.text() => Ok(body?),
        }
    }

    /// Announce presence on the data channels and groups. Returns the HTTP
    /// status code.
    pub(crate) async fn heartbeat(
        &self,
        channels: &[String],
        groups: &[String],
        state: &BTreeMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<u16, Error> {
        let inner = &*self.inner;
        let mut url = self.url(&[
            "v2",
            "presence",
            "sub-key",
            &inner.subscribe_key,
            "channel",
            &channel_segment(channels),
            "heartbeat",
        ]);
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("heartbeat", &inner.presence_timeout.to_string());
            if !groups.is_empty() {
                q.append_pair("channel-group", &groups.join(","));
            }
            if !state.is_empty() {
                q.append_pair("state", &serde_json::to_string(state)?);
            }
        }
        self.append_identity(&mut url);

        let response = self.execute(url, inner.request_timeout, cancel).await?;
        Ok(response.status().as_u16())
    }

    /// Tell the server this client left the given channels and groups.
    pub(crate) async fn leave(
        &self,
        channels: &[String],
        groups: &[String],
        cancel: &CancellationToken,
    ) -> Result<u16, Error> {
        let inner = &*self.inner;
        let mut url = self.url(&[
            "v2",
            "presence",
            "sub-key",
            &inner.subscribe_key,
            "channel",
            &channel_segment(channels),
            "leave",
        ]);
        if !groups.is_empty() {
            url.query_pairs_mut()
                .append_pair("channel-group", &groups.join(","));
        }
        self.append_identity(&mut url);

        let response = self.execute(url, inner.request_timeout, cancel).await?;
        Ok(response.status().as_u16())
    }

    /// Fetch the server time as a timetoken.
    pub(crate) async fn time(&self, cancel: &CancellationToken) -> Result<u64, Error> {
        let mut url = self.url(&["time", "0"]);
        self.append_identity(&mut url);

        let response = self.execute(url, self.inner.request_timeout, cancel).await?;
        let body: Value = serde_json::from_str(&response.text().await?)?;
        body.get(0)
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Parse(format!("unexpected time response: {body}")))
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.inner.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn append_identity(&self, url: &mut Url) {
        let mut q = url.query_pairs_mut();
        q.append_pair("uuid", &self.inner.uuid);
        q.append_pair("pnsdk", PNSDK);
        if let Some(auth) = &self.inner.auth_key {
            q.append_pair("auth", auth);
        }
    }

    /// Send a GET, racing it against `cancel`. Non-2xx responses become
    /// [`Error::Status`].
    async fn execute(
        &self,
        url: Url,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, Error> {
        let send = self.inner.client.get(url).timeout(timeout).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = send => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                body = response.text() => body.unwrap_or_default(),
            };
            return Err(Error::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

/// Comma-joined path segment; an empty list is sent as `,`.
fn channel_segment(channels: &[String]) -> String {
    if channels.is_empty() {
        ",".to_string()
    } else {
        channels.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Transport {
        let mut config = Config::new("sub-key");
        config.uuid = "client-1".into();
        config.origin = "example.com".into();
        config.auth_key = Some("secret".into());
        Transport::new(&config).unwrap()
    }

    #[test]
    fn url_segments_are_encoded() {
        let url = transport().url(&["v2", "subscribe", "sub-key", "a b,c", "0"]);
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.path(), "/v2/subscribe/sub-key/a%20b,c/0");
    }

    #[test]
    fn identity_query() {
        let t = transport();
        let mut url = t.url(&["time", "0"]);
        t.append_identity(&mut url);
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("uuid".into(), "client-1".into())));
        assert!(pairs.contains(&("auth".into(), "secret".into())));
        assert!(pairs.iter().any(|(k, v)| k == "pnsdk" && v.starts_with("pubnub-subscriber-rs/")));
    }

    #[test]
    fn empty_channel_list_is_comma() {
        assert_eq!(channel_segment(&[]), ",");
        assert_eq!(channel_segment(&["a".into(), "b-pnpres".into()]), "a,b-pnpres");
    }
}
