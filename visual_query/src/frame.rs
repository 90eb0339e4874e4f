use crate::annotation::PassResult;
use image::RgbImage;
use parking_lot::RwLock;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame is {actual_width}x{actual_height}, configured resolution is {width}x{height}")]
    ResolutionMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },
    #[error("Failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// RGB raster at the configured resolution, tagged with its arrival order.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub image: RgbImage,
}

/// Holds the newest received frame and the newest pass result.
#[derive(Debug)]
pub struct FrameStore {
    resolution: Resolution,
    latest: watch::Sender<Option<Arc<Frame>>>,
    result: RwLock<Option<Arc<PassResult>>>,
    sequence: AtomicU64,
}

impl FrameStore {
    pub fn new(resolution: Resolution) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            resolution,
            latest,
            result: RwLock::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Swaps in a new frame and returns its sequence number.
    pub fn push(&self, image: RgbImage) -> Result<u64, FrameError> {
        if image.width() != self.resolution.width || image.height() != self.resolution.height {
            return Err(FrameError::ResolutionMismatch {
                width: self.resolution.width,
                height: self.resolution.height,
                actual_width: image.width(),
                actual_height: image.height(),
            });
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest
            .send_replace(Some(Arc::new(Frame { sequence, image })));
        Ok(sequence)
    }

    /// Decodes an encoded image (JPEG, PNG, ...) and stores it.
    pub fn push_encoded(&self, data: &[u8]) -> Result<u64, FrameError> {
        let image = image::load_from_memory(data)?.to_rgb8();
        self.push(image)
    }

    pub fn current(&self) -> Option<Arc<Frame>> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> FrameReceiver {
        FrameReceiver {
            rx: self.latest.subscribe(),
        }
    }

    pub fn store_result(&self, result: Arc<PassResult>) {
        *self.result.write() = Some(result);
    }

    pub fn latest_result(&self) -> Option<Arc<PassResult>> {
        self.result.read().clone()
    }
}

pub struct FrameReceiver {
    rx: watch::Receiver<Option<Arc<Frame>>>,
}

impl FrameReceiver {
    /// Waits at most `timeout` for a frame newer than the last one seen, then
    /// returns whatever frame is newest (possibly the one already seen).
    pub async fn receive_latest(&mut self, timeout: Duration) -> Option<Arc<Frame>> {
        match tokio::time::timeout(timeout, self.rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::debug!("Frame store dropped"),
            Err(_) => tracing::debug!("No new frame within {:?}, reusing last", timeout),
        }
        self.rx.borrow_and_update().clone()
    }
}
