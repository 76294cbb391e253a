//! Concurrent image acquisition.
//!
//! [`FetchPool`] runs a feeder thread and `max_workers` fetch threads connected by bounded
//! channels. The consumer drains a [`FetchStream`]; when it falls behind, the bounded queues
//! stall the feeder instead of buffering the whole dataset in memory.

use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::artwork::ArtworkRecord;
use crate::error::FetchError;
use crate::pipeline::StopSignal;
use crate::pixels::PixelImage;

const USER_AGENT: &str = concat!("artsearch/", env!("CARGO_PKG_VERSION"));

/// Largest image body a fetch will buffer.
pub const MAX_IMAGE_BYTES: u64 = 32 * 1024 * 1024;

/// Outcome of acquiring one artwork image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// Image downloaded and decoded.
    Ok,
    /// No URL, unreachable host, or non-success HTTP status.
    NotFound,
    /// The request exceeded the fetch timeout.
    Timeout,
    /// The payload could not be decoded as an image or exceeded the size cap.
    DecodeError,
}

/// One artwork after the fetch stage. Transient: dropped once embedded or recorded as failed.
#[derive(Debug)]
pub struct FetchedImage {
    /// Source record.
    pub record: ArtworkRecord,
    /// Fetch classification.
    pub status: FetchStatus,
    /// Decoded pixels, present only when `status` is `Ok`.
    pub image: Option<PixelImage>,
    /// Failure detail for non-`Ok` statuses.
    pub error: Option<FetchError>,
}

impl FetchedImage {
    /// Successful fetch.
    pub fn ok(record: ArtworkRecord, image: PixelImage) -> Self {
        Self {
            record,
            status: FetchStatus::Ok,
            image: Some(image),
            error: None,
        }
    }

    /// Failed fetch, classified from the error.
    pub fn failed(record: ArtworkRecord, error: FetchError) -> Self {
        Self {
            record,
            status: error.status(),
            image: None,
            error: Some(error),
        }
    }

    /// Identifier of the artwork this image belongs to.
    pub fn artwork_id(&self) -> &str {
        &self.record.id
    }
}

/// Resolves an image URL into decoded pixels.
pub trait ImageFetcher: Send + Sync {
    /// Downloads and decodes the image at `url`.
    fn fetch(&self, url: &str) -> Result<PixelImage, FetchError>;
}

/// Blocking HTTP fetcher with a per-request timeout and a body size cap.
#[derive(Clone)]
pub struct HttpImageFetcher {
    client: Client,
    resolution: u32,
    max_bytes: u64,
}

impl HttpImageFetcher {
    /// Builds a fetcher that prepares images for a model with the given input `resolution`.
    pub fn new(timeout: Duration, resolution: u32) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .context("failed to build image HTTP client")?;
        Ok(Self {
            client,
            resolution,
            max_bytes: MAX_IMAGE_BYTES,
        })
    }

    /// Overrides the body size cap (default [`MAX_IMAGE_BYTES`]).
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes.max(1);
        self
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str) -> Result<PixelImage, FetchError> {
        let parsed = Url::parse(url).map_err(|err| FetchError::InvalidUrl {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        let response = self
            .client
            .get(parsed)
            .send()
            .map_err(|err| transport_error(url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let too_large = || FetchError::TooLarge {
            url: url.to_string(),
            limit: self.max_bytes,
        };
        if response
            .content_length()
            .is_some_and(|length| length > self.max_bytes)
        {
            return Err(too_large());
        }
        let bytes = read_capped(response, self.max_bytes)
            .map_err(|err| read_error(url, err))?
            .ok_or_else(too_large)?;
        PixelImage::decode(&bytes, self.resolution).map_err(|err| FetchError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Http {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Reads at most `limit` bytes; `None` when the body is longer than that.
fn read_capped<R: Read>(reader: R, limit: u64) -> io::Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut body)?;
    Ok((body.len() as u64 <= limit).then_some(body))
}

fn read_error(url: &str, err: io::Error) -> FetchError {
    let timed_out = err.kind() == io::ErrorKind::TimedOut
        || err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout);
    if timed_out {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Http {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Bounded worker pool that turns artwork records into [`FetchedImage`]s.
#[derive(Debug, Clone, Copy)]
pub struct FetchPool {
    max_workers: usize,
    queue_depth: usize,
}

impl FetchPool {
    /// Pool with `max_workers` fetch threads and a queue depth of twice that.
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            queue_depth: max_workers * 2,
        }
    }

    /// Overrides the bounded queue depth between stages.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Number of fetch threads.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Starts fetching `records` and returns the lazy result stream.
    ///
    /// Records without an image URL are classified `not_found` by the feeder without touching
    /// the network. Once `stop` is requested the feeder dispatches nothing further; records
    /// already dispatched still come out of the stream.
    pub fn spawn(
        &self,
        records: Vec<ArtworkRecord>,
        fetcher: Arc<dyn ImageFetcher>,
        stop: StopSignal,
    ) -> std::io::Result<FetchStream> {
        let (task_tx, task_rx) = bounded::<ArtworkRecord>(self.queue_depth);
        let (result_tx, result_rx) = bounded::<FetchedImage>(self.queue_depth);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let dispatched = Arc::new(AtomicUsize::new(0));

        for worker_id in 0..self.max_workers {
            let worker_rx = task_rx.clone();
            let worker_tx = result_tx.clone();
            let worker_fetcher = Arc::clone(&fetcher);
            let worker_in_flight = Arc::clone(&in_flight);
            thread::Builder::new()
                .name(format!("artsearch-fetch-{worker_id}"))
                .spawn(move || {
                    worker_loop(
                        worker_id,
                        worker_rx,
                        worker_tx,
                        worker_fetcher,
                        worker_in_flight,
                    )
                })?;
        }
        drop(task_rx);

        let feeder_dispatched = Arc::clone(&dispatched);
        thread::Builder::new()
            .name("artsearch-fetch-feeder".to_string())
            .spawn(move || feed_loop(records, task_tx, result_tx, feeder_dispatched, stop))?;

        Ok(FetchStream {
            receiver: result_rx,
            in_flight,
            dispatched,
        })
    }
}

/// Lazy sequence of fetch results, in completion order.
pub struct FetchStream {
    receiver: Receiver<FetchedImage>,
    in_flight: Arc<AtomicUsize>,
    dispatched: Arc<AtomicUsize>,
}

impl FetchStream {
    /// Requests currently on the network.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Records handed to the pool so far.
    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::Acquire)
    }

    /// Results waiting for the consumer.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }
}

impl Iterator for FetchStream {
    type Item = FetchedImage;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

fn feed_loop(
    records: Vec<ArtworkRecord>,
    tasks: Sender<ArtworkRecord>,
    results: Sender<FetchedImage>,
    dispatched: Arc<AtomicUsize>,
    stop: StopSignal,
) {
    for record in records {
        if stop.is_requested() {
            debug!("stop requested; feeder halting dispatch");
            break;
        }
        dispatched.fetch_add(1, Ordering::AcqRel);
        let sent = if record.image_ref().is_none() {
            results
                .send(FetchedImage::failed(record, FetchError::MissingUrl))
                .is_ok()
        } else {
            tasks.send(record).is_ok()
        };
        if !sent {
            break;
        }
    }
}

fn worker_loop(
    worker_id: usize,
    receiver: Receiver<ArtworkRecord>,
    sender: Sender<FetchedImage>,
    fetcher: Arc<dyn ImageFetcher>,
    in_flight: Arc<AtomicUsize>,
) {
    for record in receiver.iter() {
        let fetched = {
            let _active = InFlightGuard::new(in_flight.as_ref());
            match record.image_ref().map(str::to_string) {
                Some(url) => match fetcher.fetch(&url) {
                    Ok(image) => FetchedImage::ok(record, image),
                    Err(err) => {
                        warn!(
                            worker = worker_id,
                            artwork = %record.id,
                            error = %err,
                            "image fetch failed"
                        );
                        FetchedImage::failed(record, err)
                    }
                },
                None => FetchedImage::failed(record, FetchError::MissingUrl),
            }
        };
        if sender.send(fetched).is_err() {
            break;
        }
    }
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct CountingFetcher {
        calls: Mutex<Vec<String>>,
    }

    impl ImageFetcher for CountingFetcher {
        fn fetch(&self, url: &str) -> Result<PixelImage, FetchError> {
            self.calls.lock().expect("calls lock").push(url.to_string());
            if url.contains("slow") {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                });
            }
            Ok(PixelImage::from_rgb(1, 1, vec![1, 2, 3]).expect("pixel"))
        }
    }

    fn record(id: usize, url: Option<&str>) -> ArtworkRecord {
        ArtworkRecord {
            id: format!("test:{id}"),
            title: format!("Work {id}"),
            artist_name: String::new(),
            museum: "Test Museum".to_string(),
            image_url: url.map(str::to_string),
            source_dataset: "test".to_string(),
            object_type: None,
            date_text: None,
            web_url: None,
            artist_birth: None,
            artist_death: None,
        }
    }

    #[test]
    fn every_record_yields_one_result() {
        let fetcher = Arc::new(CountingFetcher {
            calls: Mutex::new(Vec::new()),
        });
        let records: Vec<_> = (0..25)
            .map(|i| match i % 5 {
                0 => record(i, None),
                1 => record(i, Some("https://img.test/slow.jpg")),
                _ => record(i, Some("https://img.test/ok.jpg")),
            })
            .collect();

        let stream = FetchPool::new(4)
            .spawn(records, fetcher.clone(), StopSignal::new())
            .expect("spawn pool");
        let results: Vec<FetchedImage> = stream.collect();

        assert_eq!(results.len(), 25);
        let ids: HashSet<&str> = results.iter().map(FetchedImage::artwork_id).collect();
        assert_eq!(ids.len(), 25);
        let count = |status| results.iter().filter(|r| r.status == status).count();
        assert_eq!(count(FetchStatus::NotFound), 5);
        assert_eq!(count(FetchStatus::Timeout), 5);
        assert_eq!(count(FetchStatus::Ok), 15);
        // Records without URLs never reach the fetcher.
        assert_eq!(fetcher.calls.lock().expect("calls lock").len(), 20);
    }

    #[test]
    fn stop_before_start_dispatches_nothing() {
        let fetcher = Arc::new(CountingFetcher {
            calls: Mutex::new(Vec::new()),
        });
        let stop = StopSignal::new();
        stop.request();
        let records = vec![record(1, Some("https://img.test/ok.jpg"))];
        let mut stream = FetchPool::new(2)
            .spawn(records, fetcher, stop)
            .expect("spawn pool");
        assert!(stream.next().is_none());
        assert_eq!(stream.dispatched(), 0);
    }

    /// Blocks every fetch briefly and records the peak number of concurrent calls.
    #[derive(Default)]
    struct GatedFetcher {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ImageFetcher for GatedFetcher {
        fn fetch(&self, _url: &str) -> Result<PixelImage, FetchError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(PixelImage::from_rgb(1, 1, vec![1, 2, 3]).expect("pixel"))
        }
    }

    #[test]
    fn concurrent_fetches_never_exceed_max_workers() {
        let fetcher = Arc::new(GatedFetcher::default());
        let records: Vec<_> = (0..40)
            .map(|i| record(i, Some("https://img.test/ok.jpg")))
            .collect();
        let mut stream = FetchPool::new(3)
            .spawn(records, fetcher.clone(), StopSignal::new())
            .expect("spawn pool");
        let mut received = 0;
        while stream.next().is_some() {
            received += 1;
            assert!(stream.in_flight() <= 3);
        }
        assert_eq!(received, 40);
        let peak = fetcher.peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak concurrency was {peak}");
    }

    #[test]
    fn bodies_over_the_cap_are_refused() {
        let body = vec![7u8; 16];
        let exact = read_capped(io::Cursor::new(&body), 16).expect("read");
        assert_eq!(exact.map(|bytes| bytes.len()), Some(16));
        assert!(read_capped(io::Cursor::new(&body), 15)
            .expect("read")
            .is_none());
        let err = FetchError::TooLarge {
            url: "https://img.test/huge.tif".to_string(),
            limit: 15,
        };
        assert_eq!(err.status(), FetchStatus::DecodeError);
    }

    #[test]
    fn invalid_urls_are_not_found() {
        let fetcher =
            HttpImageFetcher::new(Duration::from_secs(1), 16).expect("build fetcher");
        let err = fetcher.fetch("not a url").expect_err("invalid url");
        assert_eq!(err.status(), FetchStatus::NotFound);
    }
}
