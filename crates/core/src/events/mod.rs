//! Hardware event contract and the threads that carry events to the
//! controller.
//!
//! Sources never call the controller directly. They push [`DeviceEvent`]s
//! into a bounded channel and a single dispatcher thread hands them over one
//! at a time, catching and logging anything the handler throws.

use std::{
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::{
    config::NetworkConfig,
    session::{DeviceState, DurationMode, TagId},
    Result,
};

pub const EVENT_CAPACITY: usize = 256;

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);
const STORY_RECHECK: Duration = Duration::from_secs(1);

/// Everything the outside world can tell the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    TagDetected { reader: String, tag: TagId },
    TagRemoved { reader: String },
    /// Encoder detents, positive clockwise.
    Rotate(i32),
    Click,
    LongPress,
    DurationChanged(DurationMode),
    Connectivity(bool),
    /// Natural end of the story audio.
    StoryFinished,
}

/// Consumer side of the event contract.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: DeviceEvent) -> Result<()>;
}

/// Hands one event to `handler`. Errors and panics are logged and
/// swallowed so the calling thread keeps running.
pub fn dispatch(handler: &dyn EventHandler, event: DeviceEvent) {
    let label = format!("{event:?}");
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(event = %label, error = %err, "event handling failed"),
        Err(_) => error!(event = %label, "event handler panicked"),
    }
}

/// Cloneable producer handle given to every event source.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<DeviceEvent>,
}

impl EventSender {
    /// Queues an event without blocking. Returns `false` if it was dropped.
    pub fn send(&self, event: DeviceEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(?event, "event channel full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(event)) => {
                debug!(?event, "event channel closed");
                false
            }
        }
    }
}

pub fn channel() -> (EventSender, Receiver<DeviceEvent>) {
    let (tx, rx) = flume::bounded(EVENT_CAPACITY);
    (EventSender { tx }, rx)
}

/// Background thread handle. Signals the thread and joins it on drop.
pub struct SourceThread {
    name: String,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SourceThread {
    /// Runs `poll` repeatedly until shut down. `poll` returns how long to
    /// wait before the next call; a panic is logged and `fallback` is used.
    pub fn spawn<F>(name: &str, fallback: Duration, mut poll: F) -> Result<Self>
    where
        F: FnMut() -> Duration + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread_name = name.to_string();

        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!(source = %thread_name, "source thread started");
            while !flag.load(Ordering::Relaxed) {
                let delay = match panic::catch_unwind(AssertUnwindSafe(&mut poll)) {
                    Ok(delay) => delay,
                    Err(_) => {
                        error!(source = %thread_name, "source poll panicked");
                        fallback
                    }
                };
                sleep_unless(&flag, delay);
            }
            debug!(source = %thread_name, "source thread stopped");
        })?;

        Ok(Self {
            name: name.to_string(),
            shutdown,
            handle: Some(handle),
        })
    }

    /// Runs the dispatcher: drains `events` into `handler` until shut down
    /// or every sender is gone.
    pub fn dispatcher(events: Receiver<DeviceEvent>, handler: Arc<dyn EventHandler>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("event-dispatch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    match events.recv_timeout(SHUTDOWN_POLL) {
                        Ok(event) => {
                            debug!(?event, "dispatching");
                            dispatch(handler.as_ref(), event);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("event dispatcher stopped");
            })?;

        Ok(Self {
            name: "event-dispatch".into(),
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(source = %self.name, "source thread panicked");
            }
        }
    }
}

impl Drop for SourceThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sleep_unless(flag: &AtomicBool, delay: Duration) {
    let deadline = Instant::now() + delay;
    loop {
        if flag.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SHUTDOWN_POLL));
    }
}

/// Edge-triggered internet reachability check.
pub struct ConnectivityProbe {
    check: Box<dyn FnMut() -> bool + Send>,
    last: Option<bool>,
}

impl ConnectivityProbe {
    /// Probes by opening a TCP connection to the configured host.
    pub fn tcp(config: &NetworkConfig) -> Self {
        let target = format!("{}:{}", config.probe_host, config.probe_port);
        let timeout = Duration::from_millis(config.probe_timeout_ms);
        Self::with_check(move || tcp_reachable(&target, timeout))
    }

    pub fn with_check(check: impl FnMut() -> bool + Send + 'static) -> Self {
        Self {
            check: Box::new(check),
            last: None,
        }
    }

    /// Runs one check and reports the new status only when it changed. The
    /// first check always reports.
    pub fn poll(&mut self) -> Option<bool> {
        let online = (self.check)();
        if self.last == Some(online) {
            return None;
        }
        self.last = Some(online);
        info!(online, "connectivity changed");
        Some(online)
    }

    /// Polls every `interval`, pausing while a story is loaded so playback
    /// is never interrupted by a network blip.
    pub fn spawn<S>(mut self, interval: Duration, events: EventSender, state: S) -> Result<SourceThread>
    where
        S: Fn() -> DeviceState + Send + 'static,
    {
        SourceThread::spawn("net-probe", interval, move || {
            if state().has_story() {
                return STORY_RECHECK;
            }
            if let Some(online) = self.poll() {
                events.send(DeviceEvent::Connectivity(online));
            }
            interval
        })
    }
}

fn tcp_reachable(target: &str, timeout: Duration) -> bool {
    let addrs: Vec<SocketAddr> = match target.to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(err) => {
            debug!(%target, error = %err, "probe address did not resolve");
            return false;
        }
    };
    addrs
        .iter()
        .any(|addr| TcpStream::connect_timeout(addr, timeout).is_ok())
}

/// Physical duration selector. `None` means the reading was not one of the
/// known positions.
pub trait DurationSelector: Send + Sync {
    fn read(&self) -> Option<DurationMode>;
}

/// Watches a selector and reports valid changes.
pub fn watch_duration(
    selector: Arc<dyn DurationSelector>,
    interval: Duration,
    events: EventSender,
) -> Result<SourceThread> {
    let mut last = selector.read();
    SourceThread::spawn("duration-selector", interval, move || {
        let current = selector.read();
        if let Some(mode) = current {
            if current != last {
                events.send(DeviceEvent::DurationChanged(mode));
            }
            last = current;
        }
        interval
    })
}
