//! Observer callbacks and their delivery gate

use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

use tandem_core::{
    ConnectionId, EncodedAudioPacket, IceConnectionState, IceGatheringState, VideoFrame,
};

/// Consumer-implemented callbacks.
///
/// Every callback runs on an internal thread, concurrently with the
/// consumer's own threads, and receives the [`ConnectionId`] it belongs to so
/// one observer can serve many connections. Frames and packets are borrowed
/// for the duration of the call only.
///
/// Callbacks may call back into the connection, including `close()`.
pub trait PeerObserver: Send + Sync + 'static {
    fn on_ice_connection_state(&self, connection: ConnectionId, state: IceConnectionState) {
        let _ = (connection, state);
    }

    fn on_ice_gathering_state(&self, connection: ConnectionId, state: IceGatheringState) {
        let _ = (connection, state);
    }

    fn on_video_frame(&self, connection: ConnectionId, frame: &VideoFrame) {
        let _ = (connection, frame);
    }

    fn on_encoded_audio(&self, connection: ConnectionId, packet: &EncodedAudioPacket) {
        let _ = (connection, packet);
    }
}

type StateCallback<S> = Box<dyn Fn(ConnectionId, S) + Send + Sync>;
type UnitCallback<U> = Box<dyn Fn(ConnectionId, &U) + Send + Sync>;

/// Closure-based observer. Unset callbacks are ignored.
#[derive(Default)]
pub struct ObserverCallbacks {
    on_ice_connection_state: Option<StateCallback<IceConnectionState>>,
    on_ice_gathering_state: Option<StateCallback<IceGatheringState>>,
    on_video_frame: Option<UnitCallback<VideoFrame>>,
    on_encoded_audio: Option<UnitCallback<EncodedAudioPacket>>,
}

impl ObserverCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_ice_connection_state<F>(mut self, f: F) -> Self
    where
        F: Fn(ConnectionId, IceConnectionState) + Send + Sync + 'static,
    {
        self.on_ice_connection_state = Some(Box::new(f));
        self
    }

    pub fn on_ice_gathering_state<F>(mut self, f: F) -> Self
    where
        F: Fn(ConnectionId, IceGatheringState) + Send + Sync + 'static,
    {
        self.on_ice_gathering_state = Some(Box::new(f));
        self
    }

    pub fn on_video_frame<F>(mut self, f: F) -> Self
    where
        F: Fn(ConnectionId, &VideoFrame) + Send + Sync + 'static,
    {
        self.on_video_frame = Some(Box::new(f));
        self
    }

    pub fn on_encoded_audio<F>(mut self, f: F) -> Self
    where
        F: Fn(ConnectionId, &EncodedAudioPacket) + Send + Sync + 'static,
    {
        self.on_encoded_audio = Some(Box::new(f));
        self
    }
}

impl PeerObserver for ObserverCallbacks {
    fn on_ice_connection_state(&self, connection: ConnectionId, state: IceConnectionState) {
        if let Some(cb) = &self.on_ice_connection_state {
            cb(connection, state);
        }
    }

    fn on_ice_gathering_state(&self, connection: ConnectionId, state: IceGatheringState) {
        if let Some(cb) = &self.on_ice_gathering_state {
            cb(connection, state);
        }
    }

    fn on_video_frame(&self, connection: ConnectionId, frame: &VideoFrame) {
        if let Some(cb) = &self.on_video_frame {
            cb(connection, frame);
        }
    }

    fn on_encoded_audio(&self, connection: ConnectionId, packet: &EncodedAudioPacket) {
        if let Some(cb) = &self.on_encoded_audio {
            cb(connection, packet);
        }
    }
}

thread_local! {
    /// Depth of observer callbacks running on this thread, across all gates
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

/// Whether the current thread is inside any observer callback
pub(crate) fn in_callback() -> bool {
    DELIVERING.with(|d| d.get() > 0)
}

/// Invoke an observer callback, marking the thread as delivering. A
/// panicking observer is logged and does not take the calling task down.
fn invoke<F: FnOnce()>(f: F) {
    struct Depth;
    impl Drop for Depth {
        fn drop(&mut self) {
            DELIVERING.with(|d| d.set(d.get().saturating_sub(1)));
        }
    }

    DELIVERING.with(|d| d.set(d.get() + 1));
    let _depth = Depth;
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("Observer callback panicked; continuing");
    }
}

/// Admission control for callbacks of one connection.
///
/// Callbacks run through [`DeliveryGate::run`] without any connection lock
/// held. [`DeliveryGate::stop`] refuses new callbacks without waiting;
/// [`DeliveryGate::seal`] also waits for the ones in progress, then marks
/// the gate sealed for [`DeliveryGate::wait_sealed`].
#[derive(Default)]
pub(crate) struct DeliveryGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

#[derive(Default)]
struct GateState {
    stopped: bool,
    sealed: bool,
    in_flight: usize,
}

struct InFlight<'a> {
    gate: &'a DeliveryGate,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_flight -= 1;
        self.gate.idle.notify_all();
    }
}

impl DeliveryGate {
    /// Run `f` unless the gate is stopped. Returns whether it ran.
    pub fn run<F: FnOnce()>(&self, f: F) -> bool {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return false;
            }
            state.in_flight += 1;
        }
        let _in_flight = InFlight { gate: self };
        invoke(f);
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Refuse new callbacks. Callbacks already running are not waited for.
    pub fn stop(&self) {
        self.state.lock().stopped = true;
    }

    /// Block until the gate has been sealed
    pub fn wait_sealed(&self) {
        let mut state = self.state.lock();
        while !state.sealed {
            self.idle.wait(&mut state);
        }
    }

    /// Stop admitting callbacks and wait for the running ones to finish.
    ///
    /// Must not be called from inside a callback of this gate.
    pub fn seal(&self) {
        self.seal_with(|| {});
    }

    /// Like [`DeliveryGate::seal`], then run `last` as the final callback
    /// before the gate counts as sealed.
    pub fn seal_with<F: FnOnce()>(&self, last: F) {
        {
            let mut state = self.state.lock();
            state.stopped = true;
            while state.in_flight > 0 {
                self.idle.wait(&mut state);
            }
        }
        invoke(last);
        let mut state = self.state.lock();
        state.sealed = true;
        self.idle.notify_all();
    }
}
