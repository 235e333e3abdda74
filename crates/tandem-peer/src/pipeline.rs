//! Media delivery lanes
//!
//! Each media kind gets its own lane: a one-slot channel drained by a task on
//! the factory runtime that hands units to the observer. While a unit is being
//! delivered at most one more may wait; anything beyond that is dropped at the
//! ingress so a slow observer never builds up a backlog. Units of one kind are
//! delivered in arrival order.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use tandem_core::{ConnectionId, EncodedAudioPacket, MediaKind, VideoFrame};

use crate::observer::{DeliveryGate, PeerObserver};

/// What happened to a unit handed to [`MediaIngress`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted for delivery
    Queued,
    /// The lane was busy; the unit was discarded
    Dropped,
    /// The unit failed validation and was discarded
    Malformed,
    /// Media is not flowing (not connected, or closed)
    Inactive,
}

#[derive(Debug, Default)]
struct LaneCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
}

impl LaneCounters {
    fn snapshot(&self) -> LaneStats {
        LaneStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Counters for one media kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub delivered: u64,
    pub dropped: u64,
    pub malformed: u64,
}

/// Delivery counters of one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub video: LaneStats,
    pub audio: LaneStats,
}

impl PipelineStats {
    pub fn lane(&self, kind: MediaKind) -> LaneStats {
        match kind {
            MediaKind::Video => self.video,
            MediaKind::Audio => self.audio,
        }
    }
}

struct Inner {
    connection: ConnectionId,
    active: AtomicBool,
    video_tx: Mutex<Option<mpsc::Sender<VideoFrame>>>,
    audio_tx: Mutex<Option<mpsc::Sender<EncodedAudioPacket>>>,
    video: LaneCounters,
    audio: LaneCounters,
}

impl Inner {
    fn counters(&self, kind: MediaKind) -> &LaneCounters {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    fn push<T>(
        &self,
        kind: MediaKind,
        sender: &Mutex<Option<mpsc::Sender<T>>>,
        unit: T,
        valid: bool,
    ) -> PushOutcome {
        let counters = self.counters(kind);
        if !valid {
            counters.malformed.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Malformed;
        }
        if !self.active.load(Ordering::Acquire) {
            return PushOutcome::Inactive;
        }

        let guard = sender.lock();
        let Some(tx) = guard.as_ref() else {
            return PushOutcome::Inactive;
        };
        match tx.try_send(unit) {
            Ok(()) => PushOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("{} {} lane busy, dropping unit", self.connection, kind);
                PushOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => PushOutcome::Inactive,
        }
    }
}

/// Entry point for decoded video and encoded audio.
///
/// This is what the decode layer feeds. Cloning is cheap and every clone
/// feeds the same connection.
#[derive(Clone)]
pub struct MediaIngress {
    inner: Arc<Inner>,
}

impl MediaIngress {
    /// Offer a decoded frame for delivery
    pub fn push_video(&self, frame: VideoFrame) -> PushOutcome {
        let valid = match frame.validate() {
            Ok(()) => true,
            Err(e) => {
                debug!("{} discarding malformed frame: {}", self.inner.connection, e);
                false
            }
        };
        self.inner.push(MediaKind::Video, &self.inner.video_tx, frame, valid)
    }

    /// Offer an encoded audio packet for delivery
    pub fn push_audio(&self, packet: EncodedAudioPacket) -> PushOutcome {
        let valid = packet.validate().is_ok();
        self.inner.push(MediaKind::Audio, &self.inner.audio_tx, packet, valid)
    }

    /// Whether media is currently flowing
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }
}

/// The delivery lanes of one connection
pub(crate) struct MediaPipeline {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaPipeline {
    /// Spawn the video and audio lanes on `handle`. Media stays inactive
    /// until [`MediaPipeline::activate`].
    pub fn start(
        handle: &Handle,
        connection: ConnectionId,
        observer: Arc<dyn PeerObserver>,
        gate: Arc<DeliveryGate>,
    ) -> Self {
        let (video_tx, video_rx) = mpsc::channel::<VideoFrame>(1);
        let (audio_tx, audio_rx) = mpsc::channel::<EncodedAudioPacket>(1);
        let inner = Arc::new(Inner {
            connection,
            active: AtomicBool::new(false),
            video_tx: Mutex::new(Some(video_tx)),
            audio_tx: Mutex::new(Some(audio_tx)),
            video: LaneCounters::default(),
            audio: LaneCounters::default(),
        });

        let video = {
            let observer = observer.clone();
            spawn_lane(
                handle,
                inner.clone(),
                gate.clone(),
                MediaKind::Video,
                video_rx,
                move |frame| observer.on_video_frame(connection, frame),
            )
        };
        let audio = spawn_lane(
            handle,
            inner.clone(),
            gate,
            MediaKind::Audio,
            audio_rx,
            move |packet| observer.on_encoded_audio(connection, packet),
        );

        Self {
            inner,
            tasks: Mutex::new(vec![video, audio]),
        }
    }

    pub fn ingress(&self) -> MediaIngress {
        MediaIngress {
            inner: self.inner.clone(),
        }
    }

    pub fn activate(&self) {
        if !self.inner.active.swap(true, Ordering::AcqRel) {
            debug!("{} media active", self.inner.connection);
        }
    }

    pub fn deactivate(&self) {
        if self.inner.active.swap(false, Ordering::AcqRel) {
            debug!("{} media inactive", self.inner.connection);
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            video: self.inner.video.snapshot(),
            audio: self.inner.audio.snapshot(),
        }
    }

    /// Stop both lanes. Units still queued are discarded.
    pub fn shutdown(&self) {
        self.deactivate();
        self.inner.video_tx.lock().take();
        self.inner.audio_tx.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn spawn_lane<T, F>(
    handle: &Handle,
    inner: Arc<Inner>,
    gate: Arc<DeliveryGate>,
    kind: MediaKind,
    mut rx: mpsc::Receiver<T>,
    deliver: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    handle.spawn(async move {
        while let Some(unit) = rx.recv().await {
            let counters = inner.counters(kind);
            if !inner.active.load(Ordering::Acquire) {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if gate.run(|| deliver(&unit)) {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                break;
            }
        }
        if gate.is_stopped() {
            debug!("{} {} lane stopped", inner.connection, kind);
        } else {
            warn!("{} {} lane ended before close", inner.connection, kind);
        }
    })
}
