//! Image persistence pipeline.
//!
//! A bounded queue of [`SaveRequest`]s drained FIFO by one worker thread.
//! The request being written counts against the capacity, and producers
//! block once that many requests are in flight. A thumbnail is generated only
//! for a request with nothing queued behind it when it is dequeued, so a
//! burst that backs up the queue yields a thumbnail for its last frame.
//! Shutdown drains every queued request first.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::{self, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{CameraError, Result};
use crate::imaging::{self, Orientation, Thumbnail, JPEG_QUALITY};
use crate::traits::{FourCC, SessionListener};

/// Directory under the store root holding thumbnail PNGs.
pub const THUMBNAIL_DIR: &str = ".thumbnails";

/// Where a capture was taken.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    /// Degrees north.
    pub latitude: f64,
    /// Degrees east.
    pub longitude: f64,
    /// Metres above sea level.
    pub altitude: Option<f64>,
}

/// Name and capture time of a saved image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// File stem, unique per capture.
    pub title: String,
    /// Wall-clock capture time.
    pub taken_at: SystemTime,
}

/// A captured frame on its way to storage.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    /// Raw frame bytes.
    pub data: Vec<u8>,
    /// Destination descriptor.
    pub destination: Destination,
    /// Optional geotag.
    pub location: Option<Location>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Layout of `data`.
    pub fourcc: FourCC,
    /// Display rotation.
    pub orientation: Orientation,
    /// Width of the thumbnail to generate.
    pub thumbnail_width: u32,
}

/// Storage collaborator the pipeline writes through.
pub trait ImageStore: Send + 'static {
    /// Persist one image, returning where it went.
    fn write_image(&mut self, request: &SaveRequest) -> Result<PathBuf>;

    /// Persist the thumbnail of the most recent image.
    fn write_thumbnail(&mut self, thumbnail: &Thumbnail) -> Result<()> {
        let _ = thumbnail;
        Ok(())
    }
}

#[derive(Serialize)]
struct Sidecar<'a> {
    title: &'a str,
    taken_at_ms: u128,
    width: u32,
    height: u32,
    source_format: String,
    orientation: Orientation,
    location: Option<Location>,
}

/// Filesystem store: one JPEG plus a JSON sidecar per capture.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Store rooted at `root`; directories are created on first write.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write(path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CameraError::StorageWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, contents).map_err(|source| CameraError::StorageWrite {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ImageStore for DirectoryStore {
    fn write_image(&mut self, request: &SaveRequest) -> Result<PathBuf> {
        let title = &request.destination.title;
        let path = self.root.join(format!("{title}.jpg"));

        if request.fourcc == FourCC::MJPG {
            Self::write(&path, &request.data)?;
        } else {
            let rgb = imaging::to_rgb(&request.data, request.width, request.height, request.fourcc)?;
            Self::write(&path, &imaging::encode_jpeg(&rgb, JPEG_QUALITY)?)?;
        }

        let sidecar = Sidecar {
            title,
            taken_at_ms: request
                .destination
                .taken_at
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis())
                .unwrap_or_default(),
            width: request.width,
            height: request.height,
            source_format: request.fourcc.to_string(),
            orientation: request.orientation,
            location: request.location,
        };
        let json = serde_json::to_vec_pretty(&sidecar)
            .map_err(|err| CameraError::Io(std::io::Error::other(err)))?;
        Self::write(&self.root.join(format!("{title}.json")), &json)?;

        Ok(path)
    }

    fn write_thumbnail(&mut self, thumbnail: &Thumbnail) -> Result<()> {
        let path = self
            .root
            .join(THUMBNAIL_DIR)
            .join(format!("{}.png", thumbnail.title));
        Self::write(&path, &imaging::encode_png(&thumbnail.image)?)
    }
}

/// Counters reported when the pipeline shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Images written.
    pub saved: usize,
    /// Requests dropped after a storage failure.
    pub failed: usize,
    /// Thumbnails generated.
    pub thumbnails: usize,
}

/// Handle to the persistence worker.
pub struct SavePipeline {
    sender: Option<Sender<SaveRequest>>,
    worker: Option<JoinHandle<PipelineStats>>,
    capacity: usize,
}

impl SavePipeline {
    /// Start a worker writing through `store`.
    ///
    /// `capacity` bounds the requests in flight, the one being written
    /// included.
    pub fn spawn<S: ImageStore>(
        store: S,
        capacity: usize,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Self> {
        let capacity = capacity.max(1);
        // The worker holds one request outside the channel while writing it
        let (sender, receiver) = channel::bounded(capacity - 1);

        let worker = thread::Builder::new()
            .name("image-saver".to_owned())
            .spawn(move || run_worker(store, &receiver, listener.as_ref()))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            capacity,
        })
    }

    /// Queue `request`, blocking while the queue is full.
    pub fn submit(&self, request: SaveRequest) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| CameraError::Io(std::io::Error::other("image pipeline stopped")))?;
        if sender.is_full() {
            debug!(title = %request.destination.title, "save queue full, waiting");
        }
        sender
            .send(request)
            .map_err(|_| CameraError::Io(std::io::Error::other("image saver exited")))
    }

    /// Requests waiting for the worker.
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }

    /// Requests allowed in flight, the one being written included.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Write every queued request, then stop the worker.
    pub fn shutdown(&mut self) -> PipelineStats {
        self.sender.take();
        let Some(worker) = self.worker.take() else {
            return PipelineStats::default();
        };
        worker.join().unwrap_or_else(|_| {
            error!("image saver panicked");
            PipelineStats::default()
        })
    }
}

impl Drop for SavePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<S: ImageStore>(
    mut store: S,
    requests: &Receiver<SaveRequest>,
    listener: &dyn SessionListener,
) -> PipelineStats {
    let mut stats = PipelineStats::default();

    for request in requests {
        let most_recent = requests.is_empty();
        let title = request.destination.title.clone();

        match store.write_image(&request) {
            Ok(path) => {
                stats.saved += 1;
                debug!(%title, path = %path.display(), "image saved");
            }
            Err(err) => {
                stats.failed += 1;
                warn!(%title, error = %err, "dropping image after storage failure");
                continue;
            }
        }

        if most_recent {
            match thumbnail_for(&request) {
                Ok(thumbnail) => {
                    if let Err(err) = store.write_thumbnail(&thumbnail) {
                        warn!(%title, error = %err, "thumbnail not cached");
                    }
                    stats.thumbnails += 1;
                    listener.on_thumbnail_ready(&thumbnail);
                }
                Err(err) => warn!(%title, error = %err, "thumbnail generation failed"),
            }
        }
    }

    info!(
        saved = stats.saved,
        failed = stats.failed,
        thumbnails = stats.thumbnails,
        "image saver drained"
    );
    stats
}

fn thumbnail_for(request: &SaveRequest) -> Result<Thumbnail> {
    let rgb = imaging::to_rgb(&request.data, request.width, request.height, request.fourcc)?;
    Ok(Thumbnail {
        title: request.destination.title.clone(),
        image: imaging::make_thumbnail(&rgb, request.thumbnail_width, request.orientation),
    })
}
