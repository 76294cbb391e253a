//! Embedding capability: the vision-language model behind a narrow interface.
//!
//! A backend is constructed once (model loaded, device capability reported), owned by a
//! single engine for the whole run, and released at the end. Image and text encoders share
//! one vector space, which is what makes text queries retrieve images.

pub mod clip_http;

use serde::{Deserialize, Serialize};

use crate::error::EmbedError;
use crate::pixels::PixelImage;

/// Inference device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// CPU execution.
    Cpu,
    /// GPU execution.
    Gpu,
}

/// Caller preference for device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceRequest {
    /// Use a GPU when the backend reports one.
    #[default]
    Auto,
    /// Force CPU execution.
    Cpu,
}

/// What the loaded model can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapability {
    /// Device the model runs on.
    pub device: Device,
    /// Whether half-precision kernels are available.
    pub half_precision: bool,
}

impl DeviceCapability {
    /// CPU-only capability.
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            half_precision: false,
        }
    }

    /// GPU capability with optional fp16 support.
    pub fn gpu(half_precision: bool) -> Self {
        Self {
            device: Device::Gpu,
            half_precision,
        }
    }

    /// Applies the caller's device request to a reported capability.
    pub fn restrict(self, request: DeviceRequest) -> Self {
        match request {
            DeviceRequest::Auto => self,
            DeviceRequest::Cpu => Self::cpu(),
        }
    }
}

/// Numeric precision used for inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit floats.
    Fp32,
    /// 16-bit floats.
    Fp16,
}

impl Precision {
    /// fp16 only on a GPU that supports it, and only when full precision is not forced.
    pub fn select(capability: &DeviceCapability, force_full: bool) -> Self {
        match capability.device {
            Device::Gpu if capability.half_precision && !force_full => Self::Fp16,
            _ => Self::Fp32,
        }
    }

    /// Lowercase label stored with vectors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
        }
    }
}

/// Embedding produced for one artwork.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    /// Artwork the vector belongs to.
    pub artwork_id: String,
    /// L2-normalised components; length equals the model dimension.
    pub vector: Vec<f32>,
    /// Precision the vector was computed at.
    pub precision: Precision,
    /// Model identifier reported by the backend.
    pub model_version: String,
}

/// Embedding model interface consumed by the engine and the query path.
///
/// Methods take `&mut self`: the inference device is exclusively owned by one caller.
pub trait EmbeddingBackend {
    /// Device capability reported when the model was loaded.
    fn capability(&self) -> DeviceCapability;

    /// Model identifier stored with every vector.
    fn model_version(&self) -> &str;

    /// Output dimension.
    fn dimension(&self) -> usize;

    /// Embeds a batch of images; fails as a unit on invalid input.
    fn embed_images(
        &mut self,
        images: &[PixelImage],
        precision: Precision,
    ) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Embeds a text query into the image vector space.
    fn embed_text(&mut self, text: &str, precision: Precision) -> Result<Vec<f32>, EmbedError>;

    /// Releases model resources at the end of a run.
    fn release(&mut self) {}
}

impl<T: EmbeddingBackend + ?Sized> EmbeddingBackend for Box<T> {
    fn capability(&self) -> DeviceCapability {
        (**self).capability()
    }

    fn model_version(&self) -> &str {
        (**self).model_version()
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn embed_images(
        &mut self,
        images: &[PixelImage],
        precision: Precision,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        (**self).embed_images(images, precision)
    }

    fn embed_text(&mut self, text: &str, precision: Precision) -> Result<Vec<f32>, EmbedError> {
        (**self).embed_text(text, precision)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Scales `vector` to unit length in place. Zero or non-finite norms leave it untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm.is_finite() && norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fp16_requires_gpu_support_and_no_override() {
        assert_eq!(
            Precision::select(&DeviceCapability::gpu(true), false),
            Precision::Fp16
        );
        assert_eq!(
            Precision::select(&DeviceCapability::gpu(true), true),
            Precision::Fp32
        );
        assert_eq!(
            Precision::select(&DeviceCapability::gpu(false), false),
            Precision::Fp32
        );
        assert_eq!(
            Precision::select(&DeviceCapability::cpu(), false),
            Precision::Fp32
        );
    }

    #[test]
    fn forced_cpu_drops_half_precision() {
        let cap = DeviceCapability::gpu(true).restrict(DeviceRequest::Cpu);
        assert_eq!(cap, DeviceCapability::cpu());
        assert_eq!(Precision::select(&cap, false), Precision::Fp32);
    }

    #[test]
    fn normalizes_to_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
