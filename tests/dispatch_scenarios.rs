//! End-to-end dispatch scenarios driven through a fake event source.
//!
//! Each test runs a real daemon loop on its own thread, feeds it raw events
//! through a `ChannelSource`, and observes handler side effects.

use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use vigild::config::{EventSpec, Settings};
use vigild::daemon::{ControlHandle, Daemon, RunOutcome};
use vigild::handler::{EventPayload, HandlerRegistry};
use vigild::source::{ChannelSource, RawEvent};
use vigild::watch::{FsEvent, FsEventBatch, FsEventFlags};

const WAIT: Duration = Duration::from_secs(5);

fn base_settings(coalesce_ms: u64) -> Settings {
    let mut settings = Settings::default();
    settings.daemon.coalesce_ms = coalesce_ms;
    settings.daemon.tick_secs = 1;
    settings
}

fn fs_event(path: PathBuf, flags: FsEventFlags, seq: u64) -> RawEvent {
    RawEvent::Fs(FsEventBatch {
        events: vec![FsEvent { path, flags, seq }],
    })
}

/// Run a daemon on its own thread, handing back the control handle once the
/// loop is live.
fn spawn_daemon(
    settings: Settings,
    build_registry: impl FnOnce() -> HandlerRegistry + Send + 'static,
    config_path: Option<PathBuf>,
    source: ChannelSource,
) -> (ControlHandle, thread::JoinHandle<RunOutcome>) {
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let mut builder = Daemon::builder()
            .settings(settings)
            .registry(build_registry())
            .filesystem_events(false)
            .signals(false)
            .watch_executable(false)
            .source(source);
        if let Some(path) = config_path {
            builder = builder.config_path(path);
        }
        let mut daemon = builder.build();
        daemon.start().expect("daemon should start");
        tx.send(daemon.control()).expect("main thread is waiting");
        daemon.run()
    });
    let control = rx.recv().expect("daemon thread died during startup");
    (control, join)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn command_handler_fires_once_for_nested_change() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().canonicalize().unwrap();
    let watched = base.join("watched");
    fs::create_dir_all(watched.join("sub")).unwrap();
    let out = base.join("out.txt");

    let mut settings = base_settings(25);
    settings.events.fs.insert(
        watched.display().to_string(),
        EventSpec::command(format!(
            "echo \"$key|$path|$recursive\" >> {}",
            out.display()
        )),
    );

    let source = ChannelSource::new("fake-fs");
    let events = source.handle();
    let (control, join) = spawn_daemon(settings, HandlerRegistry::new, None, source);

    events.deliver(fs_event(
        watched.join("sub").join("x.txt"),
        FsEventFlags::empty(),
        1,
    ));
    wait_until("command output", || out.exists());

    control.interrupt();
    assert_eq!(join.join().unwrap(), RunOutcome::Interrupted);

    let output = fs::read_to_string(&out).unwrap();
    assert_eq!(
        output.trim(),
        format!(
            "{}|{}|false",
            watched.display(),
            watched.join("sub").display()
        )
    );
    // Exactly one invocation for one dispatched event.
    assert_eq!(output.lines().count(), 1);
}

#[test]
fn nested_roots_both_fire() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().canonicalize().unwrap();
    fs::create_dir_all(base.join("a/b")).unwrap();

    let mut settings = base_settings(25);
    settings.events.fs.insert(
        base.join("a").display().to_string(),
        EventSpec::function("tag.outer"),
    );
    settings.events.fs.insert(
        base.join("a/b").display().to_string(),
        EventSpec::function("tag.inner"),
    );

    let (fired_tx, fired_rx) = mpsc::channel::<&'static str>();
    let source = ChannelSource::new("fake-fs");
    let events = source.handle();
    let build = move || {
        let mut registry = HandlerRegistry::new();
        let outer = fired_tx.clone();
        registry.register_function("tag.outer", move |_ctx| {
            let _ = outer.send("outer");
            Ok(())
        });
        registry.register_function("tag.inner", move |_ctx| {
            let _ = fired_tx.send("inner");
            Ok(())
        });
        registry
    };
    let (control, join) = spawn_daemon(settings, build, None, source);

    events.deliver(fs_event(base.join("a/b/c.txt"), FsEventFlags::empty(), 1));

    let mut seen = vec![
        fired_rx.recv_timeout(WAIT).unwrap(),
        fired_rx.recv_timeout(WAIT).unwrap(),
    ];
    seen.sort();
    assert_eq!(seen, vec!["inner", "outer"]);

    control.interrupt();
    join.join().unwrap();
}

#[test]
fn repeated_batches_dispatch_independently() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().canonicalize().unwrap();
    let watched = base.join("spool");
    fs::create_dir_all(&watched).unwrap();

    let mut settings = base_settings(25);
    settings.events.fs.insert(
        watched.display().to_string(),
        EventSpec::function("count"),
    );

    let (fired_tx, fired_rx) = mpsc::channel::<()>();
    let source = ChannelSource::new("fake-fs");
    let events = source.handle();
    let build = move || {
        let mut registry = HandlerRegistry::new();
        registry.register_function("count", move |_ctx| {
            let _ = fired_tx.send(());
            Ok(())
        });
        registry
    };
    let (control, join) = spawn_daemon(settings, build, None, source);

    let batch = fs_event(watched.join("x.txt"), FsEventFlags::empty(), 1);
    events.deliver(batch.clone());
    fired_rx.recv_timeout(WAIT).unwrap();

    // The identical batch again produces an independent invocation.
    events.deliver(batch);
    fired_rx.recv_timeout(WAIT).unwrap();

    control.interrupt();
    join.join().unwrap();
}

#[test]
fn overflow_flag_reaches_handlers_as_recursive() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().canonicalize().unwrap();
    let watched = base.join("spool");
    fs::create_dir_all(&watched).unwrap();

    let mut settings = base_settings(25);
    settings.events.fs.insert(
        watched.display().to_string(),
        EventSpec::function("check.recursive"),
    );

    let (fired_tx, fired_rx) = mpsc::channel::<bool>();
    let source = ChannelSource::new("fake-fs");
    let events = source.handle();
    let build = move || {
        let mut registry = HandlerRegistry::new();
        registry.register_function("check.recursive", move |ctx| {
            if let EventPayload::Fs { recursive, .. } = &ctx.payload {
                let _ = fired_tx.send(*recursive);
            }
            Ok(())
        });
        registry
    };
    let (control, join) = spawn_daemon(settings, build, None, source);

    events.deliver(fs_event(
        watched.join("x.txt"),
        FsEventFlags::USER_DROPPED,
        1,
    ));
    assert!(fired_rx.recv_timeout(WAIT).unwrap());

    events.deliver(fs_event(watched.join("y.txt"), FsEventFlags::empty(), 2));
    assert!(!fired_rx.recv_timeout(WAIT).unwrap());

    control.interrupt();
    join.join().unwrap();
}

#[test]
fn workspace_and_store_events_dispatch_by_key() {
    let mut settings = base_settings(25);
    settings.events.workspace.insert(
        "NSWorkspaceDidWakeNotification".to_string(),
        EventSpec::function("note.wake"),
    );
    settings.events.store.insert(
        "State:/Network/Global/IPv4".to_string(),
        EventSpec::function("note.net"),
    );

    let (fired_tx, fired_rx) = mpsc::channel::<&'static str>();
    let source = ChannelSource::new("fake-os");
    let events = source.handle();
    let build = move || {
        let mut registry = HandlerRegistry::new();
        let wake = fired_tx.clone();
        registry.register_function("note.wake", move |_ctx| {
            let _ = wake.send("wake");
            Ok(())
        });
        registry.register_function("note.net", move |_ctx| {
            let _ = fired_tx.send("net");
            Ok(())
        });
        registry
    };
    let (control, join) = spawn_daemon(settings, build, None, source);

    events.deliver(RawEvent::Workspace {
        name: "NSWorkspaceDidWakeNotification".to_string(),
        user_info: None,
    });
    assert_eq!(fired_rx.recv_timeout(WAIT).unwrap(), "wake");

    // A batch re-dispatches per key; unknown keys are ignored.
    events.deliver(RawEvent::StoreKeys {
        keys: vec![
            "State:/Network/Global/IPv4".to_string(),
            "State:/Unconfigured".to_string(),
        ],
        info: None,
    });
    assert_eq!(fired_rx.recv_timeout(WAIT).unwrap(), "net");
    assert!(
        fired_rx
            .recv_timeout(Duration::from_millis(200))
            .is_err(),
        "unmatched keys must not fire handlers"
    );

    control.interrupt();
    join.join().unwrap();
}

#[test]
fn config_mtime_drift_triggers_restart() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().canonicalize().unwrap();
    let config = base.join("config.toml");
    fs::write(&config, "# v1\n").unwrap();

    let source = ChannelSource::new("fake-fs");
    let events = source.handle();
    let (control, join) = spawn_daemon(
        base_settings(25),
        HandlerRegistry::new,
        Some(config.clone()),
        source,
    );

    thread::sleep(Duration::from_millis(30));
    fs::write(&config, "# v2\n").unwrap();

    // Any event in the config's directory forces the baseline check,
    // regardless of which file actually changed.
    events.deliver(fs_event(base.join("other.txt"), FsEventFlags::empty(), 1));

    // If the restart never fires the watchdog fails the test via Interrupted.
    let watchdog = control.clone();
    thread::spawn(move || {
        thread::sleep(WAIT);
        watchdog.interrupt();
    });

    match join.join().unwrap() {
        RunOutcome::Restart(reason) => assert!(reason.contains("configuration file")),
        other => panic!("expected a restart, got {other:?}"),
    }
}
