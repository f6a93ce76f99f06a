//! HTTP image service client.
//!
//! Talks to the image API of one region:
//! - `POST   /v1/regions/{region}/images`       register
//! - `GET    /v1/regions/{region}/images/{id}`  describe
//! - `DELETE /v1/regions/{region}/images/{id}`  deregister

use std::time::Duration;

use amiforge_id::{ImageId, Region};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::ServiceConfig;
use crate::service::{Image, ImageService, RegisterImageRequest, ServiceError};

/// Image API client bound to one region.
pub struct HttpImageService {
    client: reqwest::Client,
    base_url: String,
    region: Region,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterImageResponse {
    pub image_id: ImageId,
}

impl HttpImageService {
    /// Create a new client.
    pub fn new(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            region: config.region.clone(),
        })
    }

    fn images_url(&self) -> String {
        format!("{}/v1/regions/{}/images", self.base_url, self.region)
    }

    fn image_url(&self, id: &ImageId) -> String {
        format!("{}/{}", self.images_url(), id)
    }
}

/// Turn a non-success response into [`ServiceError::Api`].
async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response, ServiceError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!(status = %status, body = %body, "Failed to {action}");
    Err(ServiceError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ImageService for HttpImageService {
    fn region(&self) -> &Region {
        &self.region
    }

    async fn register_image(&self, request: &RegisterImageRequest) -> Result<ImageId, ServiceError> {
        let url = self.images_url();
        debug!(url = %url, name = %request.name, "Registering image");

        let response = self.client.post(&url).json(request).send().await?;
        let response = check(response, "register image").await?;

        let body: RegisterImageResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        Ok(body.image_id)
    }

    async fn describe_image(&self, id: &ImageId) -> Result<Option<Image>, ServiceError> {
        let url = self.image_url(id);
        debug!(url = %url, "Describing image");

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, "describe image").await?;

        let image: Image = response
            .json()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        Ok(Some(image))
    }

    async fn deregister_image(&self, id: &ImageId) -> Result<(), ServiceError> {
        let url = self.image_url(id);
        debug!(url = %url, "Deregistering image");

        let response = self.client.delete(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(image_id = %id, "Image already gone");
            return Ok(());
        }
        check(response, "deregister image").await?;

        Ok(())
    }
}
