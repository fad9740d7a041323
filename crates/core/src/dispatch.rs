//! Single-attempt request dispatch to the chat completion upstream.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::{
    chat::{upstream_error_message, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Sampling},
    config::{ApiKey, DecisionConfig, UpstreamMode},
    error::{AvionError, Result},
};

/// Sends one completion request and returns the first completion's text.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<String>;
}

/// Routing target, fixed at construction.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Direct { url: Url, api_key: Option<ApiKey> },
    Proxy { url: Url },
}

impl Endpoint {
    pub fn from_config(cfg: &DecisionConfig) -> Result<Self> {
        let url = cfg.endpoint()?;
        Ok(match cfg.mode {
            UpstreamMode::Direct => Endpoint::Direct {
                url,
                api_key: cfg.api_key.clone(),
            },
            UpstreamMode::Proxy => Endpoint::Proxy { url },
        })
    }

    pub fn url(&self) -> &Url {
        match self {
            Endpoint::Direct { url, .. } | Endpoint::Proxy { url } => url,
        }
    }
}

/// reqwest-backed [`ChatBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    endpoint: Endpoint,
}

impl HttpBackend {
    pub fn new(client: Client, endpoint: Endpoint) -> Self {
        Self { client, endpoint }
    }

    pub fn from_config(cfg: &DecisionConfig) -> Result<Self> {
        let endpoint = Endpoint::from_config(cfg)?;
        let client = build_client(cfg.request_timeout());
        Ok(Self::new(client, endpoint))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

pub(crate) fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("failed to build http client, falling back to default: {}", e);
            Client::new()
        })
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<String> {
        let url = self.endpoint.url().clone();
        let mut builder = self.client.post(url.clone()).json(request);
        if let Endpoint::Direct { api_key, .. } = &self.endpoint {
            let key = api_key.as_ref().ok_or_else(|| {
                AvionError::Config(
                    "API key not configured; set AVION_GROQ_API_KEY or GROQ_API_KEY".to_string(),
                )
            })?;
            builder = builder.bearer_auth(key.expose());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = upstream_error_message(&body).unwrap_or_else(|| "Unknown error".to_string());
            debug!(%url, %status, model = %request.model, "upstream rejected request");
            return Err(AvionError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        parsed.into_first_content().ok_or_else(|| AvionError::Upstream {
            status: status.as_u16(),
            message: "response contained no completion".to_string(),
        })
    }
}

/// Picks the model for an attempt and hands the request to the backend.
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn ChatBackend>,
    model: String,
    fallback_model: String,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        model: impl Into<String>,
        fallback_model: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            fallback_model: fallback_model.into(),
        }
    }

    pub fn model_for(&self, use_fallback_model: bool) -> &str {
        if use_fallback_model {
            &self.fallback_model
        } else {
            &self.model
        }
    }

    pub async fn dispatch(
        &self,
        messages: &[ChatMessage],
        sampling: Sampling,
        use_fallback_model: bool,
    ) -> Result<String> {
        let request =
            ChatCompletionRequest::new(self.model_for(use_fallback_model), messages, sampling);
        self.backend.complete(&request).await
    }
}
