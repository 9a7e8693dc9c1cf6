//! The run loop driver.
//!
//! One daemon owns all dispatch state: the handler registry, the watch
//! index, the restart supervisor and the per-kind handler maps. Exactly one
//! thread runs the loop; every handler invocation, including external
//! command execution, runs synchronously on it and blocks it until
//! completion. There is no preemption and no concurrent handler execution.
//!
//! Startup sequences as: resolve handlers -> install watches -> capture the
//! restart baseline -> install the signal listener -> start event sources ->
//! enter the loop. Any startup failure is fatal and surfaces to the process
//! exit code.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select, tick, unbounded};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;

use crate::config::Settings;
use crate::handler::{
    EventPayload, HandlerHandle, HandlerRegistry, ResolveError, SourceKind,
};
use crate::restart::{RestartError, RestartSupervisor};
use crate::source::{EventSource, NotifyFsSource, RawEvent, SourceError};
use crate::watch::{Coalescer, WatchError, WatchIndex};

/// Lifecycle of one daemon instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    Starting,
    Running,
    Stopping,
    Terminated,
}

/// Why the run loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// User interrupt; the process should exit 0.
    Interrupted,
    /// A restart was requested; the caller rebuilds a fresh daemon.
    Restart(String),
}

/// Cooperative control messages delivered into the run loop.
#[derive(Debug, Clone)]
enum Control {
    Interrupt,
    Restart(String),
}

/// Errors that abort startup. All fatal; the process exits nonzero.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("handler for {kind} event '{key}' cannot be resolved: {source}")]
    Handler {
        kind: SourceKind,
        key: String,
        #[source]
        source: ResolveError,
    },

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Restart(#[from] RestartError),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[from] std::io::Error),

    #[error("daemon was already started")]
    AlreadyStarted,
}

/// Lets other threads stop or recycle the run loop.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<Control>,
}

impl ControlHandle {
    /// Ask the loop to exit with [`RunOutcome::Interrupted`].
    pub fn interrupt(&self) -> bool {
        self.tx.send(Control::Interrupt).is_ok()
    }

    /// Ask the loop to exit with [`RunOutcome::Restart`].
    pub fn restart(&self, reason: impl Into<String>) -> bool {
        self.tx.send(Control::Restart(reason.into())).is_ok()
    }
}

/// Builder for one daemon instance.
pub struct DaemonBuilder {
    settings: Settings,
    registry: HandlerRegistry,
    config_path: Option<PathBuf>,
    sources: Vec<Box<dyn EventSource>>,
    filesystem_events: bool,
    signals: bool,
    watch_executable: bool,
}

impl DaemonBuilder {
    fn new() -> Self {
        Self {
            settings: Settings::default(),
            registry: HandlerRegistry::new(),
            config_path: None,
            sources: Vec::new(),
            filesystem_events: true,
            signals: true,
            watch_executable: true,
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Registry with the embedder's named functions and classes.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Configuration file to baseline for self-restart.
    pub fn config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Add an externally-fed event source.
    pub fn source(mut self, source: impl EventSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Whether to start the OS filesystem stream over the watch roots.
    /// Disabled in tests that feed filesystem events through a fake source.
    pub fn filesystem_events(mut self, enabled: bool) -> Self {
        self.filesystem_events = enabled;
        self
    }

    /// Whether to install process signal handlers.
    pub fn signals(mut self, enabled: bool) -> Self {
        self.signals = enabled;
        self
    }

    /// Whether to baseline the running executable for self-restart.
    pub fn watch_executable(mut self, enabled: bool) -> Self {
        self.watch_executable = enabled;
        self
    }

    pub fn build(self) -> Daemon {
        let (event_tx, event_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let coalescer = Coalescer::new(self.settings.daemon.coalesce_ms);

        Daemon {
            settings: self.settings,
            registry: self.registry,
            index: WatchIndex::new(),
            supervisor: RestartSupervisor::new(),
            workspace_handlers: HashMap::new(),
            store_handlers: HashMap::new(),
            coalescer,
            sources: self.sources,
            event_tx,
            event_rx,
            control_tx,
            control_rx,
            config_path: self.config_path,
            filesystem_events: self.filesystem_events,
            signals: self.signals,
            watch_executable: self.watch_executable,
            state: DaemonState::Idle,
        }
    }
}

/// The event dispatch daemon.
pub struct Daemon {
    settings: Settings,
    registry: HandlerRegistry,
    index: WatchIndex,
    supervisor: RestartSupervisor,
    workspace_handlers: HashMap<String, Rc<HandlerHandle>>,
    store_handlers: HashMap<String, Rc<HandlerHandle>>,
    coalescer: Coalescer,
    sources: Vec<Box<dyn EventSource>>,
    event_tx: Sender<RawEvent>,
    event_rx: Receiver<RawEvent>,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    config_path: Option<PathBuf>,
    filesystem_events: bool,
    signals: bool,
    watch_executable: bool,
    state: DaemonState,
}

impl Daemon {
    pub fn builder() -> DaemonBuilder {
        DaemonBuilder::new()
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Number of resolved handlers across all sections.
    pub fn handler_count(&self) -> usize {
        self.workspace_handlers.len() + self.store_handlers.len() + self.index.callback_count()
    }

    /// A handle for stopping or recycling the loop from another thread.
    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Resolve every configured handler without entering the loop.
    ///
    /// Used by `--check`: surfaces the same fatal errors startup would.
    pub fn check(&mut self) -> Result<(), StartError> {
        if self.state != DaemonState::Idle {
            return Err(StartError::AlreadyStarted);
        }
        self.state = DaemonState::Starting;
        let result = self.resolve_handlers();
        self.state = DaemonState::Terminated;
        result
    }

    /// Bring the daemon to `Running`: resolve handlers, install watches,
    /// capture the restart baseline, install signals, start sources.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.state != DaemonState::Idle {
            return Err(StartError::AlreadyStarted);
        }
        self.state = DaemonState::Starting;

        self.resolve_handlers()?;
        self.capture_baseline()?;

        if self.signals {
            install_signal_listener(self.control_tx.clone())?;
        }

        if self.filesystem_events && !self.index.is_empty() {
            let roots: Vec<PathBuf> = self.index.roots().map(Path::to_path_buf).collect();
            self.sources.push(Box::new(NotifyFsSource::new(roots)));
        }
        for source in &mut self.sources {
            source.start(self.event_tx.clone())?;
            crate::debug_event!("daemon", "source started", "{}", source.name());
        }

        crate::log_event!(
            "daemon",
            "started",
            "{} workspace, {} store, {} fs handler(s); {} watch root(s)",
            self.workspace_handlers.len(),
            self.store_handlers.len(),
            self.index.callback_count() - self.supervisor.tracked_count(),
            self.index.root_count()
        );

        self.state = DaemonState::Running;
        Ok(())
    }

    /// Run the loop until interrupted or a restart is requested.
    ///
    /// Work sources: delivered raw events, cooperative control messages,
    /// the coalesce flush tick, and the keep-alive tick that bounds how long
    /// the thread parks between checks.
    pub fn run(mut self) -> RunOutcome {
        debug_assert_eq!(self.state, DaemonState::Running);

        let event_rx = self.event_rx.clone();
        let control_rx = self.control_rx.clone();
        let keepalive = tick(Duration::from_secs(self.settings.daemon.tick_secs.max(1)));
        let flush = tick(Duration::from_millis(
            self.settings.daemon.coalesce_ms.clamp(25, 250),
        ));

        let outcome = loop {
            select! {
                recv(event_rx) -> msg => {
                    if let Ok(event) = msg {
                        self.dispatch_raw(event);
                    }
                }
                recv(control_rx) -> msg => match msg {
                    Ok(Control::Interrupt) => {
                        crate::log_event!("daemon", "interrupt received, exiting");
                        break RunOutcome::Interrupted;
                    }
                    Ok(Control::Restart(reason)) => self.supervisor.request_restart(&reason),
                    Err(_) => {}
                },
                recv(flush) -> _ => self.flush_coalesced(),
                recv(keepalive) -> _ => tracing::debug!("[daemon] tick"),
            }

            if let Some(reason) = self.supervisor.take_pending() {
                crate::log_event!("daemon", "restarting", "{}", reason);
                break RunOutcome::Restart(reason);
            }
        };

        self.state = DaemonState::Stopping;
        self.sources.clear();
        self.state = DaemonState::Terminated;
        outcome
    }

    fn resolve_handlers(&mut self) -> Result<(), StartError> {
        for (key, spec) in &self.settings.events.workspace {
            let handle = self
                .registry
                .resolve(key, spec, SourceKind::Workspace)
                .map_err(|source| StartError::Handler {
                    kind: SourceKind::Workspace,
                    key: key.clone(),
                    source,
                })?;
            self.workspace_handlers.insert(key.clone(), Rc::new(handle));
        }

        for (key, spec) in &self.settings.events.store {
            let handle = self
                .registry
                .resolve(key, spec, SourceKind::Store)
                .map_err(|source| StartError::Handler {
                    kind: SourceKind::Store,
                    key: key.clone(),
                    source,
                })?;
            self.store_handlers.insert(key.clone(), Rc::new(handle));
        }

        for (key, spec) in &self.settings.events.fs {
            let handle = self
                .registry
                .resolve(key, spec, SourceKind::Fs)
                .map_err(|source| StartError::Handler {
                    kind: SourceKind::Fs,
                    key: key.clone(),
                    source,
                })?;
            let handle = Rc::new(handle);
            let callback = {
                let handle = Rc::clone(&handle);
                Rc::new(move |change: &crate::watch::FsChange| {
                    handle.invoke(EventPayload::Fs {
                        root: change.root.clone(),
                        path: change.path.clone(),
                        recursive: change.recursive,
                    })
                })
            };
            let root = self.index.add_watch(&expand_user(key), callback)?;
            crate::debug_event!("daemon", "watching", "{} (root {})", key, root.display());
        }

        Ok(())
    }

    fn capture_baseline(&mut self) -> Result<(), StartError> {
        if let Some(config_path) = self.config_path.clone() {
            self.supervisor.watch(
                &mut self.index,
                &config_path,
                format!("configuration file {} changed", config_path.display()),
            )?;
        }

        if self.watch_executable {
            match std::env::current_exe() {
                Ok(exe) => self.supervisor.watch(
                    &mut self.index,
                    &exe,
                    format!("executable {} was updated", exe.display()),
                )?,
                Err(err) => {
                    tracing::warn!("[daemon] cannot determine the running executable: {err}");
                }
            }
        }

        Ok(())
    }

    fn dispatch_raw(&mut self, event: RawEvent) {
        match event {
            RawEvent::Workspace { name, user_info } => match self.workspace_handlers.get(&name) {
                Some(handle) => handle.invoke(EventPayload::Workspace { user_info }),
                None => crate::debug_event!("daemon", "unmatched workspace notification", "{}", name),
            },
            RawEvent::StoreKeys { keys, info } => {
                // One batch fans out into one invocation per changed key.
                for key in keys {
                    match self.store_handlers.get(&key) {
                        Some(handle) => handle.invoke(EventPayload::Store { info: info.clone() }),
                        None => crate::debug_event!("daemon", "unmatched store key", "{}", key),
                    }
                }
            }
            RawEvent::Fs(batch) => {
                for event in batch.events {
                    self.coalescer.record(event);
                }
            }
        }
    }

    fn flush_coalesced(&mut self) {
        for event in self.coalescer.take_ready() {
            let fired = self.index.dispatch(&event.path, event.flags);
            if fired == 0 {
                crate::debug_event!("daemon", "unmatched fs event", "{}", event.path.display());
            }
        }
    }
}

/// Forward termination signals into the control channel.
///
/// SIGINT and SIGTERM interrupt the loop; SIGHUP recycles the worker. The
/// listener thread exits once the daemon side of the channel is gone.
fn install_signal_listener(tx: Sender<Control>) -> Result<(), std::io::Error> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                let control = match signal {
                    SIGHUP => Control::Restart("SIGHUP received".to_string()),
                    _ => Control::Interrupt,
                };
                if tx.send(control).is_err() {
                    break;
                }
            }
        })?;
    Ok(())
}

/// Expand a leading `~/` to the user's home directory.
fn expand_user(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
