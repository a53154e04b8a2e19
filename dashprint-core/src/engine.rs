//! The printer engine: owns the adapter/link/sequencer stack and drives the
//! connect → initialize → run → reconnect state machine described by the
//! communication protocol. This is the one type most outer callers touch.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, Notify},
    task::JoinHandle,
};

use crate::{
    adapter::{self, DATA_TIMEOUT, RECONNECT_TIMEOUT},
    codec::kv_parse,
    error::{Error, SendError},
    link::{Link, LinkEvent},
    sequencer::Sequencer,
    settings::PrinterSettings,
};

/// Any byte stream a [`Link`] can be spawned over. Implemented for the real
/// serial port and for test doubles such as `tokio::io::duplex` halves alike
/// — `Transport: Send` is a supertrait, so `Box<dyn Transport>` is `Send` too.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type BoxedTransport = Box<dyn Transport>;
type Opener = Arc<dyn Fn() -> Result<BoxedTransport, Error> + Send + Sync>;

/// Where a printer's connection currently stands. The sole mutator of this
/// field is [`Engine`]'s own state machine; every transition is observable
/// through the listener registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterState {
    Stopped,
    Disconnected,
    Initializing,
    Connected,
}

/// An opaque handle identifying one registered [`StateListener`], returned by
/// [`Engine::add_listener`] and accepted by [`Engine::remove_listener`].
/// Stands in for the source's pointer-identity listener keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Notified whenever an [`Engine`]'s state changes. Implementations must not
/// block indefinitely; a slow listener only ever delays its own
/// notifications, never another listener's or the state machine's.
pub trait StateListener: Send + Sync {
    fn on_printer_state_changed(&self, old: PrinterState, new: PrinterState);
}

struct Shared {
    state: RwLock<PrinterState>,
    listeners: RwLock<HashMap<u64, Arc<dyn StateListener>>>,
    next_listener_id: AtomicU64,
    base_parameters: RwLock<HashMap<String, String>>,
    sequencer: RwLock<Option<Arc<Sequencer>>>,
    stop_notify: Notify,
    stopped: AtomicBool,
}

impl Shared {
    fn set_state(&self, new: PrinterState) {
        let old = {
            let mut guard = self.state.write().unwrap();
            let old = *guard;
            if old == new {
                return;
            }
            *guard = new;
            old
        };
        self.fan_out(old, new);
    }

    fn fan_out(&self, old: PrinterState, new: PrinterState) {
        let snapshot: Vec<Arc<dyn StateListener>> =
            self.listeners.read().unwrap().values().cloned().collect();
        for listener in snapshot {
            tokio::spawn(async move {
                listener.on_printer_state_changed(old, new);
            });
        }
    }

    /// Waits out `dur`, or returns early (with `true`) if `Stop()` has been
    /// requested. Every suspension point in the supervisor goes through this
    /// so cancellation is checked consistently.
    async fn wait_or_stop(&self, dur: Duration) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => self.stopped.load(Ordering::Acquire),
            _ = self.stop_notify.notified() => true,
        }
    }
}

/// The runtime object for one printer: settings, current link (if any), and
/// the background task driving the connect/reconnect state machine.
pub struct Engine {
    settings: PrinterSettings,
    opener: Opener,
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("unique_name", &self.settings.unique_name)
            .field("state", &self.state())
            .finish()
    }
}

impl Engine {
    /// Builds an engine for `settings`, in state `Stopped`. Nothing is
    /// opened and no task runs until [`Engine::start`].
    pub fn load(settings: PrinterSettings) -> Self {
        let opener = default_opener(settings.device_path.clone(), settings.baud_rate);
        Self::with_opener(settings, opener)
    }

    fn with_opener(settings: PrinterSettings, opener: Opener) -> Self {
        Self {
            settings,
            opener,
            shared: Arc::new(Shared {
                state: RwLock::new(PrinterState::Stopped),
                listeners: RwLock::new(HashMap::new()),
                next_listener_id: AtomicU64::new(0),
                base_parameters: RwLock::new(HashMap::new()),
                sequencer: RwLock::new(None),
                stop_notify: Notify::new(),
                stopped: AtomicBool::new(true),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// This engine's persisted settings.
    pub fn settings(&self) -> &PrinterSettings {
        &self.settings
    }

    /// Shorthand for `settings().unique_name`, the Registry's map key.
    pub fn unique_name(&self) -> &str {
        &self.settings.unique_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PrinterState {
        *self.shared.state.read().unwrap()
    }

    /// The firmware's `M115` key/value reply, cached from the most recent
    /// successful handshake. Empty until the first `Connected` transition.
    pub fn base_parameters(&self) -> HashMap<String, String> {
        self.shared.base_parameters.read().unwrap().clone()
    }

    /// Registers a listener and returns a token that later identifies it for
    /// [`Engine::remove_listener`]. Safe to call concurrently with state
    /// transitions and with other listener registrations.
    pub fn add_listener(&self, listener: Arc<dyn StateListener>) -> ListenerId {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.write().unwrap().insert(id, listener);
        ListenerId(id)
    }

    /// Removes a previously registered listener. A stale or already-removed
    /// id is silently ignored.
    pub fn remove_listener(&self, id: ListenerId) {
        self.shared.listeners.write().unwrap().remove(&id.0);
    }

    /// Moves a `Stopped` engine to `Disconnected` and launches its
    /// supervisor task. Calling `start` on an engine that is not `Stopped`
    /// is a no-op, logged as a warning — matching the source's behavior of
    /// never double-starting a printer.
    pub fn start(&self) {
        {
            let mut state = self.shared.state.write().unwrap();
            if *state != PrinterState::Stopped {
                tracing::warn!(
                    printer = %self.settings.unique_name,
                    "start() called while not stopped"
                );
                return;
            }
            *state = PrinterState::Disconnected;
        }
        self.shared.fan_out(PrinterState::Stopped, PrinterState::Disconnected);
        self.shared.stopped.store(false, Ordering::Release);

        let shared = self.shared.clone();
        let opener = self.opener.clone();
        let unique_name = self.settings.unique_name.clone();
        let handle = tokio::spawn(async move { run(shared, opener, unique_name).await });
        *self.supervisor.lock().unwrap() = Some(handle);
    }

    /// Requests that the supervisor task stop. Observed either during a
    /// reconnect wait or right after the next write/read completes; either
    /// way the engine ends in `Stopped` without blocking the caller.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.stop_notify.notify_waiters();
    }

    /// Sends `command` and waits for its reply, same as
    /// [`Engine::send_command`] but rejecting the call while `Initializing`
    /// too (the strict form external callers may opt into, per spec's
    /// `allowInitializing = false`).
    pub async fn send_command_connected_only(
        &self,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Result<Vec<String>, SendError> {
        self.send_command_checked(command.into(), timeout, false)
            .await
    }

    /// Sends `command` to the printer and waits for its reply. Rejects
    /// immediately with `NotConnected` unless the engine is `Connected` or
    /// `Initializing` (the relaxed default, matching the handshake commands
    /// the engine itself issues during `Initializing`).
    pub async fn send_command(
        &self,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Result<Vec<String>, SendError> {
        self.send_command_checked(command.into(), timeout, true)
            .await
    }

    async fn send_command_checked(
        &self,
        command: String,
        timeout: Duration,
        allow_initializing: bool,
    ) -> Result<Vec<String>, SendError> {
        let permitted = match self.state() {
            PrinterState::Connected => true,
            PrinterState::Initializing => allow_initializing,
            PrinterState::Stopped | PrinterState::Disconnected => false,
        };
        if !permitted {
            return Err(SendError::NotConnected);
        }
        let sequencer = self.shared.sequencer.read().unwrap().clone();
        match sequencer {
            Some(sequencer) => sequencer.send(&command, timeout).await,
            None => Err(SendError::NotConnected),
        }
    }
}

fn default_opener(device_path: String, baud_rate: u32) -> Opener {
    Arc::new(move || {
        adapter::open(&device_path, baud_rate).map(|port| Box::new(port) as BoxedTransport)
    })
}

/// The supervisor task: connect, initialize, run until the link drops, then
/// reconnect, until `Stop()` is observed.
async fn run(shared: Arc<Shared>, opener: Opener, unique_name: String) {
    loop {
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }
        match opener() {
            Ok(transport) => {
                if run_connected(&shared, &unique_name, transport).await {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(printer = %unique_name, error = %e, "failed to open serial port");
                shared.set_state(PrinterState::Disconnected);
                if shared.wait_or_stop(RECONNECT_TIMEOUT).await {
                    break;
                }
            }
        }
    }
    shared.set_state(PrinterState::Stopped);
}

/// Drives one connection attempt from `Initializing` through to the link's
/// end. Returns `true` if `Stop()` was observed and the supervisor should
/// exit entirely, `false` if it should loop around and reconnect.
async fn run_connected(shared: &Arc<Shared>, unique_name: &str, transport: BoxedTransport) -> bool {
    shared.set_state(PrinterState::Initializing);
    if shared.wait_or_stop(Duration::from_secs(1)).await {
        return true;
    }

    let mut link = Link::spawn(transport);
    let events = link.subscribe();
    let sequencer = Arc::new(Sequencer::new(link.writer(), link.closer(), events));
    *shared.sequencer.write().unwrap() = Some(sequencer.clone());

    match handshake(&sequencer).await {
        Ok(params) => {
            *shared.base_parameters.write().unwrap() = params;
            shared.set_state(PrinterState::Connected);
        }
        Err(e) => {
            tracing::warn!(printer = %unique_name, error = %e, "handshake failed");
            *shared.sequencer.write().unwrap() = None;
            link.closer().close();
            link.closed().await;
            shared.set_state(PrinterState::Disconnected);
            return shared.stopped.load(Ordering::Acquire);
        }
    }

    let mut restart_rx = link.subscribe();
    let stop_requested = tokio::select! {
        _ = link.closed() => false,
        () = wait_for_restart(&mut restart_rx) => false,
        _ = shared.stop_notify.notified() => true,
    };

    *shared.sequencer.write().unwrap() = None;
    link.closer().close();
    link.closed().await;
    shared.set_state(PrinterState::Disconnected);
    stop_requested || shared.stopped.load(Ordering::Acquire)
}

/// Sends the `M110 N0` / `M115` handshake and folds every accumulated reply
/// line's `key:value` pairs into one map, last write wins.
async fn handshake(sequencer: &Sequencer) -> Result<HashMap<String, String>, SendError> {
    sequencer.send("M110 N0", DATA_TIMEOUT).await?;
    let reply = sequencer.send("M115", DATA_TIMEOUT).await?;
    let mut params = HashMap::new();
    for line in &reply {
        for (k, v) in kv_parse(line) {
            params.insert(k, v);
        }
    }
    Ok(params)
}

async fn wait_for_restart(rx: &mut broadcast::Receiver<LinkEvent>) {
    loop {
        match rx.recv().await {
            Ok(LinkEvent::Restart) => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
impl Engine {
    /// Test-only constructor that replaces the real serial open with
    /// `opener`, so the full connect/handshake/reconnect state machine can
    /// be driven over an in-memory `tokio::io::duplex` half instead of real
    /// hardware.
    pub(crate) fn load_for_test(
        settings: PrinterSettings,
        opener: impl Fn() -> Result<BoxedTransport, Error> + Send + Sync + 'static,
    ) -> Self {
        Self::with_opener(settings, Arc::new(opener))
    }
}
