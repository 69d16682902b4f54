//! HTTP model service speaking server-sent events
//!
//! The assembled [`ModelRequest`] is posted as JSON and every SSE `data`
//! payload is handed to the decoder as one opaque frame.

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource, retry::Never};

use crate::error::{Error, Result};
use crate::model::ModelService;
use crate::stream::FrameStream;
use crate::types::ModelRequest;

/// Model service reached over HTTP + SSE
pub struct SseModelService {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    headers: Vec<(String, String)>,
}

impl SseModelService {
    /// Create a service posting to `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: None,
            headers: vec![],
        }
    }

    /// Send `Authorization: Bearer <key>` with every request
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Add an extra request header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn build_headers(&self) -> Result<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("text/event-stream"),
        );
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        if let Some(ref key) = self.api_key {
            let value = format!("Bearer {}", key)
                .parse::<reqwest::header::HeaderValue>()
                .map_err(|e| Error::Sse(format!("Invalid API key header: {}", e)))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        for (key, value) in &self.headers {
            if let (Ok(name), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, val);
            } else {
                tracing::warn!("Skipping invalid header '{}'", key);
            }
        }
        Ok(headers)
    }
}

#[async_trait]
impl ModelService for SseModelService {
    async fn invoke(&self, request: ModelRequest) -> Result<FrameStream> {
        tracing::debug!("Model service URL: {}", self.endpoint);

        let request_builder = self
            .client
            .post(&self.endpoint)
            .headers(self.build_headers()?)
            .json(&request);

        let mut event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;
        // Frame streams are not restartable, so reconnecting would replay a turn.
        event_source.set_retry_policy(Box::new(Never));

        Ok(Box::pin(stream! {
            while let Some(event) = event_source.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(message)) => yield Ok(message.data),
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        yield Err(Error::Sse(e.to_string()));
                        break;
                    }
                }
            }
            event_source.close();
        }))
    }
}
