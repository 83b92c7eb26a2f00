use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::media_engine::{MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::media::io::ivf_reader::IVFReader;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture permission denied")]
    Denied,
    #[error("capture backend: {0}")]
    Backend(String),
}

fn backend<E: std::fmt::Display>(e: E) -> CaptureError {
    CaptureError::Backend(e.to_string())
}

/// A captured local stream: the track set shared with every peer
/// session, a stop control, and a signal that fires if the backend
/// stops producing on its own (e.g. the user ends sharing from the OS).
pub struct LocalMedia {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    stop_tx: mpsc::Sender<()>,
    ended_rx: Option<mpsc::Receiver<()>>,
}

impl LocalMedia {
    pub fn new(
        tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
        stop_tx: mpsc::Sender<()>,
        ended_rx: Option<mpsc::Receiver<()>>,
    ) -> Self {
        Self {
            tracks,
            stop_tx,
            ended_rx,
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }

    /// Receiver that fires when the backend ends the capture externally.
    /// Yields once; subsequent calls return None.
    pub fn take_ended(&mut self) -> Option<mpsc::Receiver<()>> {
        self.ended_rx.take()
    }

    /// Tell the backend to stop producing. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

/// Platform capture acquisition. Acquiring either yields a live stream
/// or a distinguished denial when the user declines.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, CaptureError>;
}

/// Feeds pre-encoded IVF frames into a video track at frame pace,
/// looping the file until stopped. Stands in for a platform screen
/// grabber, which would hand the coordinator the same track shape.
pub struct IvfFileSource {
    path: PathBuf,
}

impl IvfFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CaptureSource for IvfFileSource {
    async fn acquire(&self) -> Result<LocalMedia, CaptureError> {
        // Probe the header up front so acquisition fails fast on a bad file.
        let mime_type = probe_codec(&self.path)?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type,
                ..Default::default()
            },
            "display".to_owned(),
            format!("video-{}", rand::random::<u32>()),
        ));

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let (ended_tx, ended_rx) = mpsc::channel::<()>(1);

        tokio::spawn(feed(self.path.clone(), Arc::clone(&track), stop_rx, ended_tx));

        Ok(LocalMedia::new(
            vec![track as Arc<dyn TrackLocal + Send + Sync>],
            stop_tx,
            Some(ended_rx),
        ))
    }
}

fn probe_codec(path: &Path) -> Result<String, CaptureError> {
    let file = std::fs::File::open(path).map_err(backend)?;
    let (_, header) = IVFReader::new(BufReader::new(file)).map_err(backend)?;
    match &header.four_cc {
        b"VP80" => Ok(MIME_TYPE_VP8.to_owned()),
        b"VP90" => Ok(MIME_TYPE_VP9.to_owned()),
        other => Err(CaptureError::Backend(format!(
            "unsupported codec {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

async fn feed(
    path: PathBuf,
    track: Arc<TrackLocalStaticSample>,
    mut stop_rx: mpsc::Receiver<()>,
    ended_tx: mpsc::Sender<()>,
) {
    if let Err(e) = feed_frames(&path, &track, &mut stop_rx).await {
        log::warn!("Capture feed stopped: {e}");
        let _ = ended_tx.try_send(());
    }
}

async fn feed_frames(
    path: &Path,
    track: &TrackLocalStaticSample,
    stop_rx: &mut mpsc::Receiver<()>,
) -> Result<(), CaptureError> {
    loop {
        let file = std::fs::File::open(path).map_err(backend)?;
        let (mut ivf, header) = IVFReader::new(BufReader::new(file)).map_err(backend)?;

        let millis = (1000 * u64::from(header.timebase_numerator))
            / u64::from(header.timebase_denominator.max(1));
        let interval = Duration::from_millis(millis.max(1));
        let mut ticker = tokio::time::interval(interval);

        let mut wrote = false;
        loop {
            // EOF rewinds to the start of the file.
            let frame = match ivf.parse_next_frame() {
                Ok((frame, _)) => frame,
                Err(_) => break,
            };
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop_rx.recv() => return Ok(()),
            }
            let data: Bytes = frame.freeze();
            let sample = Sample {
                data,
                duration: interval,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                // A viewer vanishing mid-write is not fatal to the capture.
                log::debug!("Sample dropped: {e}");
            }
            wrote = true;
        }

        if !wrote {
            return Err(CaptureError::Backend(
                "no frames in capture source".to_owned(),
            ));
        }
    }
}
