#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use artsearch::vector_store::{IndexMatch, UpsertBatch, VectorEntry};
use artsearch::{
    ArtworkMetadata, ArtworkRecord, CollectionName, DatasetFilter, DeviceCapability, EmbedError,
    EmbeddingBackend, FetchError, ImageFetcher, IndexError, MemoryIndex, MetadataSource,
    PixelImage, Precision, SourceError, StopSignal, VectorIndex,
};

pub const CORRUPT_MARKER: u8 = 0xFF;
pub const DIMENSION: usize = 4;

pub fn collection() -> CollectionName {
    CollectionName::new("public", "artworks").expect("collection")
}

pub fn entry(id: &str, vector: [f32; DIMENSION]) -> VectorEntry {
    VectorEntry {
        id: id.to_string(),
        vector: vector.to_vec(),
        metadata: ArtworkMetadata {
            title: format!("Title {id}"),
            ..ArtworkMetadata::default()
        },
        precision: Precision::Fp32,
        model_version: "scripted-clip".to_string(),
    }
}

/// Four artworks; against the default text vector they rank
/// `rijks:a`, `rijks:b`, `met:c`, `met:d`.
pub fn seeded_index() -> MemoryIndex {
    let mut index = MemoryIndex::new();
    index.ensure_collection(&collection(), DIMENSION).expect("ensure");
    let mut batch = UpsertBatch::with_capacity(8);
    batch.push(entry("rijks:b", [1.0, 0.0, 0.0, 0.0])).expect("b");
    batch.push(entry("rijks:a", [1.0, 0.0, 0.0, 0.0])).expect("a");
    batch.push(entry("met:c", [0.6, 0.8, 0.0, 0.0])).expect("c");
    batch.push(entry("met:d", [0.0, 0.0, 1.0, 0.0])).expect("d");
    index.upsert(&collection(), &batch).expect("upsert");
    index
}

pub fn record(i: usize, image_url: Option<String>) -> ArtworkRecord {
    ArtworkRecord {
        id: format!("test:{i:04}"),
        title: format!("Work {i}"),
        artist_name: "Anonymous".to_string(),
        museum: "Test Museum".to_string(),
        image_url,
        source_dataset: "test".to_string(),
        ..ArtworkRecord::default()
    }
}

pub fn ok_url(i: usize) -> Option<String> {
    Some(format!("https://img.test/ok/{i}.jpg"))
}

pub fn timeout_url(i: usize) -> Option<String> {
    Some(format!("https://img.test/timeout/{i}.jpg"))
}

pub fn corrupt_url(i: usize) -> Option<String> {
    Some(format!("https://img.test/corrupt/{i}.jpg"))
}

/// Metadata source over a fixed list.
pub struct VecSource(pub Vec<ArtworkRecord>);

impl MetadataSource for VecSource {
    fn list_artworks(
        &self,
        _filter: &DatasetFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ArtworkRecord>, SourceError> {
        let take = limit.unwrap_or(self.0.len());
        Ok(self.0.iter().take(take).cloned().collect())
    }
}

/// Fetcher whose behavior is chosen by the URL path: `/timeout/` times out, `/corrupt/`
/// yields an image the backend cannot embed, anything else succeeds.
#[derive(Default)]
pub struct ScriptedFetcher {
    pub calls: AtomicUsize,
    stop_after: Option<(usize, StopSignal)>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests `stop` once `calls` fetches have been made.
    pub fn stopping_after(calls: usize, stop: StopSignal) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            stop_after: Some((calls, stop)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageFetcher for ScriptedFetcher {
    fn fetch(&self, url: &str) -> Result<PixelImage, FetchError> {
        let made = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, stop)) = &self.stop_after {
            if made >= *limit {
                stop.request();
            }
        }
        if url.contains("/timeout/") {
            return Err(FetchError::Timeout {
                url: url.to_string(),
            });
        }
        let marker = if url.contains("/corrupt/") {
            CORRUPT_MARKER
        } else {
            (url.len() % 200) as u8
        };
        Ok(PixelImage::from_rgb(1, 1, vec![marker, 1, 2]).expect("pixel"))
    }
}

/// Backend that fails any batch containing a corrupt image, like a shape error would.
pub struct ScriptedBackend {
    capability: DeviceCapability,
    pub image_calls: Arc<AtomicUsize>,
    pub text_calls: Arc<AtomicUsize>,
    text_vector: Vec<f32>,
    fail_text: bool,
}

impl ScriptedBackend {
    pub fn new(capability: DeviceCapability) -> Self {
        Self {
            capability,
            image_calls: Arc::new(AtomicUsize::new(0)),
            text_calls: Arc::new(AtomicUsize::new(0)),
            text_vector: vec![1.0, 0.0, 0.0, 0.0],
            fail_text: false,
        }
    }

    pub fn cpu() -> Self {
        Self::new(DeviceCapability::cpu())
    }

    pub fn with_text_vector(mut self, vector: Vec<f32>) -> Self {
        self.text_vector = vector;
        self
    }

    pub fn failing_text(mut self) -> Self {
        self.fail_text = true;
        self
    }
}

impl EmbeddingBackend for ScriptedBackend {
    fn capability(&self) -> DeviceCapability {
        self.capability
    }

    fn model_version(&self) -> &str {
        "scripted-clip"
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn embed_images(
        &mut self,
        images: &[PixelImage],
        _precision: Precision,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        if images
            .iter()
            .any(|image| image.as_bytes()[0] == CORRUPT_MARKER)
        {
            return Err(EmbedError::InvalidInput(
                "tensor shape mismatch".to_string(),
            ));
        }
        Ok(images
            .iter()
            .map(|image| {
                let bytes = image.as_bytes();
                vec![bytes[0] as f32 + 1.0, bytes[1] as f32, bytes[2] as f32, 1.0]
            })
            .collect())
    }

    fn embed_text(&mut self, _text: &str, _precision: Precision) -> Result<Vec<f32>, EmbedError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_text {
            return Err(EmbedError::Status {
                status: 503,
                body: "model not loaded".to_string(),
            });
        }
        Ok(self.text_vector.clone())
    }
}

/// Index that rejects every upsert containing `poisoned_id`.
pub struct PoisonedIndex {
    pub inner: MemoryIndex,
    pub poisoned_id: String,
    pub attempts: usize,
}

impl VectorIndex for PoisonedIndex {
    fn ensure_collection(&mut self, c: &CollectionName, d: usize) -> Result<(), IndexError> {
        self.inner.ensure_collection(c, d)
    }

    fn reset(&mut self, c: &CollectionName) -> Result<(), IndexError> {
        self.inner.reset(c)
    }

    fn upsert(&mut self, c: &CollectionName, batch: &UpsertBatch) -> Result<(), IndexError> {
        if batch.contains(&self.poisoned_id) {
            self.attempts += 1;
            return Err(IndexError::Backend("deadlock detected".to_string()));
        }
        self.inner.upsert(c, batch)
    }

    fn query(
        &mut self,
        c: &CollectionName,
        v: &[f32],
        k: usize,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        self.inner.query(c, v, k)
    }

    fn count(&mut self, c: &CollectionName) -> Result<usize, IndexError> {
        self.inner.count(c)
    }

    fn existing_ids(
        &mut self,
        c: &CollectionName,
        ids: &[String],
    ) -> Result<HashSet<String>, IndexError> {
        self.inner.existing_ids(c, ids)
    }
}
