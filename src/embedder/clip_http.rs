//! Blocking client for a CLIP inference server.
//!
//! The server exposes `GET /info`, `POST /embed/images` and `POST /embed/text`. Image
//! payloads are preprocessed RGB crops sent as base64.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{l2_normalize, Device, DeviceCapability, DeviceRequest, EmbeddingBackend, Precision};
use crate::error::EmbedError;
use crate::pixels::{PixelImage, DEFAULT_INPUT_RESOLUTION};

/// CLIP backend that talks to a remote inference server.
pub struct ClipHttpBackend {
    client: Client,
    base_url: String,
    info: ServerInfo,
    capability: DeviceCapability,
    max_retries: usize,
    batch_size: usize,
}

impl ClipHttpBackend {
    /// Connects to the server at `base_url` and loads its capability report.
    ///
    /// # Arguments
    /// * `api_key` - Optional bearer token
    /// * `device` - `DeviceRequest::Cpu` forces CPU inference even when the server has a GPU
    /// * `batch_size` - Largest image batch sent per request
    pub fn connect(
        base_url: String,
        api_key: Option<String>,
        device: DeviceRequest,
        timeout: Duration,
        max_retries: usize,
        batch_size: usize,
    ) -> Result<Self> {
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "embedding server must be an http(s) URL"
        );
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key.filter(|key| !key.trim().is_empty()) {
            let auth = format!("Bearer {}", key.trim());
            headers.insert(
                reqwest::header::AUTHORIZATION,
                HeaderValue::from_str(&auth).context("invalid embedding API key")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build embedding HTTP client")?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let info: ServerInfo = client
            .get(format!("{base_url}/info"))
            .send()
            .and_then(|resp| resp.error_for_status())
            .with_context(|| format!("failed to reach embedding server at {base_url}"))?
            .json()
            .context("failed to parse embedding server info")?;
        anyhow::ensure!(info.dimension > 0, "embedding server reported dimension 0");
        let capability = info.capability().restrict(device);
        info!(
            model = %info.model,
            dimension = info.dimension,
            device = ?capability.device,
            half_precision = capability.half_precision,
            "connected to embedding server"
        );

        Ok(Self {
            client,
            base_url,
            info,
            capability,
            max_retries: max_retries.max(1),
            batch_size: batch_size.max(1),
        })
    }

    /// Square input size the server expects.
    pub fn input_resolution(&self) -> u32 {
        self.info.input_resolution
    }

    /// Maximum batch size configured for this client.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn device_label(&self) -> &'static str {
        match self.capability.device {
            Device::Cpu => "cpu",
            Device::Gpu => "gpu",
        }
    }

    fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<EmbeddingResponse, EmbedError> {
        let endpoint = format!("{}{}", self.base_url, path);
        let mut attempt = 0usize;
        loop {
            match self.client.post(&endpoint).json(body).send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json()
                            .map_err(|err| EmbedError::Response(err.to_string()));
                    }
                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        debug!(%status, attempt, "retrying embedding request");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(EmbedError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    if (err.is_timeout() || err.is_connect()) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        debug!(error = %err, attempt, "retrying embedding request");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(EmbedError::Request(err.to_string()));
                }
            }
        }
    }
}

impl EmbeddingBackend for ClipHttpBackend {
    fn capability(&self) -> DeviceCapability {
        self.capability
    }

    fn model_version(&self) -> &str {
        &self.info.model
    }

    fn dimension(&self) -> usize {
        self.info.dimension
    }

    fn embed_images(
        &mut self,
        images: &[PixelImage],
        precision: Precision,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        if images.len() > self.batch_size {
            return Err(EmbedError::InvalidInput(format!(
                "batch of {} exceeds configured max {}",
                images.len(),
                self.batch_size
            )));
        }
        let request = ImageRequest {
            model: &self.info.model,
            precision,
            device: self.device_label(),
            images: images.iter().map(ImagePayload::from_pixels).collect(),
        };
        let response = self.post("/embed/images", &request)?;
        response.into_vectors(images.len())
    }

    fn embed_text(&mut self, text: &str, precision: Precision) -> Result<Vec<f32>, EmbedError> {
        let inputs = [text];
        let request = TextRequest {
            model: &self.info.model,
            precision,
            device: self.device_label(),
            input: &inputs,
        };
        let response = self.post("/embed/text", &request)?;
        let mut vectors = response.into_vectors(1)?;
        vectors
            .pop()
            .ok_or_else(|| EmbedError::Response("server returned no text embedding".to_string()))
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(250 * (1 << capped))
}

#[derive(Debug, Deserialize)]
struct ServerInfo {
    model: String,
    dimension: usize,
    #[serde(default)]
    device: Option<Device>,
    #[serde(default)]
    half_precision: bool,
    #[serde(default = "default_resolution")]
    input_resolution: u32,
}

impl ServerInfo {
    fn capability(&self) -> DeviceCapability {
        match self.device {
            Some(Device::Gpu) => DeviceCapability::gpu(self.half_precision),
            _ => DeviceCapability::cpu(),
        }
    }
}

fn default_resolution() -> u32 {
    DEFAULT_INPUT_RESOLUTION
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    precision: Precision,
    device: &'a str,
    images: Vec<ImagePayload>,
}

#[derive(Serialize)]
struct ImagePayload {
    width: u32,
    height: u32,
    rgb: String,
}

impl ImagePayload {
    fn from_pixels(image: &PixelImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            rgb: STANDARD.encode(image.as_bytes()),
        }
    }
}

#[derive(Serialize)]
struct TextRequest<'a> {
    model: &'a str,
    precision: Precision,
    device: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

impl EmbeddingResponse {
    fn into_vectors(self, expected_len: usize) -> Result<Vec<Vec<f32>>, EmbedError> {
        if self.embeddings.len() != expected_len {
            return Err(EmbedError::Response(format!(
                "server returned {} embeddings for {} inputs",
                self.embeddings.len(),
                expected_len
            )));
        }
        let mut vectors = self.embeddings;
        for vector in vectors.iter_mut() {
            if vector.iter().any(|value| !value.is_finite()) {
                return Err(EmbedError::Response(
                    "embedding contains non-finite values".to_string(),
                ));
            }
            l2_normalize(vector);
        }
        Ok(vectors)
    }
}
