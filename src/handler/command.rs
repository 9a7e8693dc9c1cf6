//! Shell command execution for `command` handler specs.
//!
//! The child runs synchronously on the dispatch thread with the event
//! context flattened into its environment. Context variables override any
//! colliding variables inherited from the parent process.

use std::process::Command;

use serde_json::{Map, Value};

use super::{EventContext, EventPayload};

/// Run a shell command for one delivered event.
///
/// Outcome is logged; nothing propagates. A nonzero exit, signal
/// termination or spawn failure cannot halt the dispatch loop.
pub(crate) fn run(command: &str, ctx: &EventContext) {
    crate::log_event!("command", "executing", "{} ({})", command, ctx.context);

    let mut child = Command::new("/bin/sh");
    child.arg("-c").arg(command);
    for (name, value) in context_env(ctx) {
        child.env(name, value);
    }

    match child.status() {
        Ok(status) if status.success() => {
            tracing::debug!("[command] `{command}` returned 0");
        }
        Ok(status) => match status.code() {
            Some(code) => {
                tracing::error!("[command] `{command}` returned {code} ({})", ctx.context);
            }
            None => log_signal(command, &status),
        },
        Err(err) => {
            tracing::error!("[command] failed to execute `{command}`: {err}");
        }
    }
}

#[cfg(unix)]
fn log_signal(command: &str, status: &std::process::ExitStatus) {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => {
            tracing::error!("[command] `{command}` was terminated by signal {signal}");
        }
        None => tracing::error!("[command] `{command}` exited abnormally"),
    }
}

#[cfg(not(unix))]
fn log_signal(command: &str, _status: &std::process::ExitStatus) {
    tracing::error!("[command] `{command}` exited abnormally");
}

/// Flatten the event context into environment variables.
///
/// All values are stringified; nested payload mappings are flattened into
/// the same namespace.
fn context_env(ctx: &EventContext) -> Vec<(String, String)> {
    let mut vars = vec![
        ("context".to_string(), ctx.context.clone()),
        ("key".to_string(), ctx.key.clone()),
    ];

    if let Some(command) = &ctx.spec.command {
        vars.push(("command".to_string(), command.clone()));
    }
    if let Some(function) = &ctx.spec.function {
        vars.push(("function".to_string(), function.clone()));
    }
    if let Some(class) = &ctx.spec.class {
        vars.push(("class".to_string(), class.clone()));
    }
    if let Some((class, method)) = &ctx.spec.method {
        vars.push(("method".to_string(), format!("{class}.{method}")));
    }

    match &ctx.payload {
        EventPayload::Workspace {
            user_info: Some(map),
        }
        | EventPayload::Store { info: Some(map) } => flatten_map(map, &mut vars),
        EventPayload::Fs {
            root,
            path,
            recursive,
        } => {
            vars.push(("root".to_string(), root.display().to_string()));
            vars.push(("path".to_string(), path.display().to_string()));
            vars.push(("recursive".to_string(), recursive.to_string()));
        }
        _ => {}
    }

    vars
}

fn flatten_map(map: &Map<String, Value>, vars: &mut Vec<(String, String)>) {
    for (key, value) in map {
        match value {
            Value::String(s) => vars.push((key.clone(), s.clone())),
            Value::Object(nested) => flatten_map(nested, vars),
            other => vars.push((key.clone(), other.to_string())),
        }
    }
}
