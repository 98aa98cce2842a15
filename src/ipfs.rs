use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::info;

use crate::pipeline::{ContentStore, StoreError};

/// [`ContentStore`] backed by an IPFS node's HTTP API.
pub struct IpfsClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

impl IpfsClient {
    /// Create a client pointing at a custom API address.
    pub fn with_base_url(base_url: String) -> Result<Self, StoreError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

impl ContentStore for IpfsClient {
    async fn download(&self, reference: &str, dir: &Path) -> Result<PathBuf, StoreError> {
        if reference.is_empty() || reference.contains(['/', '\\']) {
            return Err(StoreError::Decode(format!("invalid content reference {reference:?}")));
        }
        let response = self
            .client
            .post(format!("{}/api/v0/cat", self.base_url))
            .query(&[("arg", reference)])
            .send()
            .await?;
        let bytes = Self::checked(response).await?.bytes().await?;

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(reference);
        tokio::fs::write(&path, &bytes).await?;
        info!(reference, path = %path.display(), size = bytes.len(), "content downloaded");
        Ok(path)
    }

    async fn upload(&self, path: &Path) -> Result<String, StoreError> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "result".to_string());
        let form = Form::new().part("file", Part::bytes(data).file_name(name));
        let response = self
            .client
            .post(format!("{}/api/v0/add", self.base_url))
            .multipart(form)
            .send()
            .await?;
        let added = Self::checked(response)
            .await?
            .json::<AddResponse>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        info!(path = %path.display(), reference = %added.hash, "content uploaded");
        Ok(added.hash)
    }
}
