//! In-process stand-ins for the external image tools.
//!
//! "Images" are text files starting with `FAKEIMG <format> <W>x<H>`; the fake
//! processor writes files in the same format with the dimensions the real
//! tool would produce, so results can be probed again.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::geometry::Geometry;
use crate::probe::{ImageInfo, ImageProbe, ProbeOutcome};
use crate::processor::ImageProcessor;
use crate::replica::{ReplicaError, ReplicaTransport};
use crate::spec::Replica;
use crate::thumbnail::CropWindow;
use crate::tool::ProcessError;

const MAGIC: &str = "FAKEIMG ";

#[derive(Default)]
pub struct FakeImageTool {
    pub probes: AtomicUsize,
    pub conversions: AtomicUsize,
    pub crops: Mutex<Vec<CropWindow>>,
    fail: AtomicBool,
    write_delay: Option<Duration>,
    delays: Mutex<VecDeque<Duration>>,
}

impl FakeImageTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes output in two halves with a pause in between
    pub fn slow(delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Like [`slow`](Self::slow), with the pause taken from `delays` in
    /// conversion order; conversions past the end do not pause
    pub fn with_delays(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            delays: Mutex::new(delays.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn image_bytes(format: &str, width: u32, height: u32) -> Vec<u8> {
        format!("{}{} {}x{}\n", MAGIC, format, width, height).into_bytes()
    }

    pub fn info_of(data: &[u8]) -> Option<ImageInfo> {
        let text = std::str::from_utf8(data).ok()?;
        let header = text.lines().next()?.strip_prefix(MAGIC)?;
        let (format, dims) = header.split_once(' ')?;
        let (w, h) = dims.split_once('x')?;
        Some(ImageInfo {
            format: format.to_string(),
            width: w.parse().ok()?,
            height: h.parse().ok()?,
        })
    }

    pub fn conversions(&self) -> usize {
        self.conversions.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    async fn source_info(&self, source: &Path) -> Result<ImageInfo, ProcessError> {
        let data = tokio::fs::read(source).await.map_err(|source| ProcessError::Spawn {
            program: "fake".to_string(),
            source,
        })?;
        Self::info_of(&data).ok_or_else(|| ProcessError::Failed {
            program: "fake".to_string(),
            code: Some(1),
            stderr: "not an image".to_string(),
        })
    }

    async fn write_output(&self, target: &Path, body: String) -> Result<(), ProcessError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProcessError::Failed {
                program: "fake".to_string(),
                code: Some(1),
                stderr: "conversion failed".to_string(),
            });
        }
        self.conversions.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .delays
            .lock()
            .unwrap()
            .pop_front()
            .or(self.write_delay);

        let io = |source| ProcessError::Spawn {
            program: "fake".to_string(),
            source,
        };
        let mut file = tokio::fs::File::create(target).await.map_err(io)?;
        let bytes = body.into_bytes();
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        file.write_all(head).await.map_err(io)?;
        file.flush().await.map_err(io)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        file.write_all(tail).await.map_err(io)?;
        file.flush().await.map_err(io)?;
        Ok(())
    }
}

fn fit(info: &ImageInfo, geometry: &Geometry) -> (u32, u32) {
    let (w, h) = (info.width as f64, info.height as f64);
    let scale = match (geometry.width, geometry.height) {
        (Some(bw), Some(bh)) => (bw as f64 / w).min(bh as f64 / h),
        (Some(bw), None) => bw as f64 / w,
        (None, Some(bh)) => bh as f64 / h,
        (None, None) => 1.0,
    };
    let out = |v: f64| ((v * scale).round() as u32).max(1);
    (out(w), out(h))
}

#[async_trait]
impl ImageProbe for FakeImageTool {
    async fn probe(&self, path: &Path) -> ProbeOutcome {
        self.probes.fetch_add(1, Ordering::SeqCst);
        match tokio::fs::read(path).await {
            Ok(data) => Self::info_of(&data)
                .map(ProbeOutcome::Image)
                .unwrap_or(ProbeOutcome::NotAnImage),
            Err(_) => ProbeOutcome::NotAnImage,
        }
    }
}

#[async_trait]
impl ImageProcessor for FakeImageTool {
    async fn thumbnail(
        &self,
        source: &Path,
        target: &Path,
        geometry: &Geometry,
    ) -> Result<(), ProcessError> {
        let info = self.source_info(source).await?;
        let (w, h) = fit(&info, geometry);
        let body = format!(
            "{}{} {}x{}\nthumbnail {}\n{}\n",
            MAGIC,
            info.format,
            w,
            h,
            geometry,
            "#".repeat(256)
        );
        self.write_output(target, body).await
    }

    async fn crop_resize(
        &self,
        source: &Path,
        target: &Path,
        window: CropWindow,
        width: u32,
        height: u32,
    ) -> Result<(), ProcessError> {
        let info = self.source_info(source).await?;
        self.crops.lock().expect("crop log lock").push(window);
        let body = format!(
            "{}{} {}x{}\ncrop {}\n{}\n",
            MAGIC,
            info.format,
            width,
            height,
            window,
            "#".repeat(256)
        );
        self.write_output(target, body).await
    }
}

/// Transport that records calls and fails for selected hosts
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<String>>,
    failing_hosts: Vec<String>,
}

impl RecordingTransport {
    pub fn failing_for(hosts: &[&str]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing_hosts: hosts.iter().map(|h| h.to_string()).collect(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("call log lock").clone()
    }

    fn record(&self, op: &str, replica: &Replica, path: &Path) -> Result<(), ReplicaError> {
        self.calls.lock().expect("call log lock").push(format!(
            "{} {} {}",
            op,
            replica.destination(),
            path.display()
        ));
        if self.failing_hosts.contains(&replica.host) {
            return Err(ReplicaError::Process(ProcessError::Failed {
                program: "ssh".to_string(),
                code: Some(255),
                stderr: "connection refused".to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicaTransport for RecordingTransport {
    async fn make_dir(&self, replica: &Replica, dir: &Path) -> Result<(), ReplicaError> {
        self.record("mkdir", replica, dir)
    }

    async fn copy(&self, replica: &Replica, path: &Path) -> Result<(), ReplicaError> {
        self.record("copy", replica, path)
    }
}
