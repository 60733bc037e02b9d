use crate::application::ports::MutationDelivery;
use crate::domain::entities::{HttpMethod, PendingQueueEntry};
use crate::shared::config::NetworkConfig;
use crate::shared::error::AppError;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// 保留キューのエントリを HTTP でそのまま再送する `MutationDelivery`
pub struct HttpMutationDelivery {
    client: Client,
    base_url: String,
}

impl HttpMutationDelivery {
    pub fn new(config: &NetworkConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .build()?;
        Ok(Self::with_client(client, &config.base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// 絶対 URL はそのまま、相対パスは base_url に連結する
    pub fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    fn request(&self, method: Method, entry: &PendingQueueEntry) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, self.resolve_url(&entry.url));
        for (name, value) in &entry.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl MutationDelivery for HttpMutationDelivery {
    async fn deliver(&self, entry: &PendingQueueEntry) -> Result<(), AppError> {
        let mut request = self.request(to_reqwest_method(entry.method), entry);
        if let Some(body) = &entry.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::SyncDelivery(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AppError::SyncDelivery(format!(
                "{} {} returned {}",
                entry.method, entry.url, status
            )))
        }
    }

    async fn fetch_current(&self, entry: &PendingQueueEntry) -> Result<Option<Value>, AppError> {
        if !entry.method.targets_existing_record() {
            return Ok(None);
        }

        let response = self.request(Method::GET, entry).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<Value>().await?)),
            status => Err(AppError::Network(format!(
                "GET {} returned {}",
                entry.url, status
            ))),
        }
    }
}
