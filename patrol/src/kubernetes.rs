use crate::config::KubernetesStore;
use crate::store::{ConfigRevision, ConfigStore, StoreError, VersionToken};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

const MERGE_PATCH: &str = "application/merge-patch+json";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    resource_version: String,
}

#[derive(Deserialize)]
struct ConfigMap {
    metadata: ObjectMeta,
    #[serde(default)]
    data: HashMap<String, String>,
}

#[derive(Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

/// One key of a ConfigMap, versioned by the object's `resourceVersion`.
pub struct ConfigMapStore {
    client: reqwest::Client,
    url: Url,
    key: String,
    // Projected service account tokens are rotated, so this is read per request.
    token_path: Option<PathBuf>,
}

impl ConfigMapStore {
    pub fn new(config: &KubernetesStore, timeout: Duration) -> Result<Self, StoreError> {
        let url = Url::parse(&format!(
            "{}/api/v1/namespaces/{}/configmaps/{}",
            config.api_url.trim_end_matches('/'),
            config.namespace,
            config.name
        ))
        .map_err(|e| StoreError::InvalidUrl(e.to_string()))?;

        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(ca_cert_path) = &config.ca_cert_path {
            let pem = std::fs::read(ca_cert_path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(ConfigMapStore {
            client: builder.build()?,
            url,
            key: config.key.clone(),
            token_path: config.token_path.clone(),
        })
    }

    async fn request(
        &self,
        method: reqwest::Method,
    ) -> Result<reqwest::RequestBuilder, StoreError> {
        let request = self.client.request(method, self.url.clone());
        match &self.token_path {
            Some(path) => {
                let token = tokio::fs::read_to_string(path).await?;
                Ok(request.header(AUTHORIZATION, format!("Bearer {}", token.trim())))
            }
            None => Ok(request),
        }
    }
}

async fn error_for_status(response: reqwest::Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiStatus>(&body)
        .map(|s| s.message)
        .unwrap_or_else(|_| body.clone());

    match status {
        StatusCode::CONFLICT => StoreError::Conflict(message),
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        _ => StoreError::Status { status, body },
    }
}

#[async_trait]
impl ConfigStore for ConfigMapStore {
    async fn get(&self) -> Result<ConfigRevision, StoreError> {
        let response = self.request(reqwest::Method::GET).await?.send().await?;
        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let mut config_map = response
            .json::<ConfigMap>()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;

        // A missing key reads as an empty document.
        let data = config_map.data.remove(&self.key).unwrap_or_default();

        Ok(ConfigRevision {
            data: data.into_bytes(),
            version: VersionToken::new(config_map.metadata.resource_version),
        })
    }

    async fn update(&self, data: Vec<u8>, version: &VersionToken) -> Result<(), StoreError> {
        let data = String::from_utf8(data)
            .map_err(|e| StoreError::InvalidResponse(format!("document is not UTF-8: {e}")))?;

        // resourceVersion in a merge patch is a precondition: the API server
        // answers 409 if the object moved on. Other keys are left alone.
        let mut data_patch = serde_json::Map::new();
        data_patch.insert(self.key.clone(), data.into());
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": version.as_str() },
            "data": data_patch,
        });

        let response = self
            .request(reqwest::Method::PATCH)
            .await?
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(patch.to_string())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        Ok(())
    }
}
