//! Configuration for the event dispatch daemon.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `VIGILD_` and use double
//! underscores to separate nested levels:
//! - `VIGILD_DAEMON__TICK_SECS=10` sets `daemon.tick_secs`
//! - `VIGILD_LOGGING__DEFAULT=debug` sets `logging.default`
//!
//! # Event sections
//!
//! Each event section is a mapping from the event-identifying string (a
//! notification name, a store key, or a filesystem path) to an [`EventSpec`]
//! naming exactly one handler action:
//!
//! ```toml
//! [events.workspace."NSWorkspaceDidWakeNotification"]
//! command = "/usr/bin/true"
//!
//! [events.store."State:/Network/Global/IPv4"]
//! function = "builtin.log"
//!
//! [events.fs."/etc/postfix"]
//! method = ["MailConfig", "reload"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use is_terminal::IsTerminal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or creating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("cannot write example configuration to {path}: {source}")]
    WriteExample {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    /// Run-loop timing knobs.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// The three event sections.
    #[serde(default)]
    pub events: EventSections,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// Keep-alive timer interval in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// How long a changed path must stay quiet before dispatch, in
    /// milliseconds. Rapid rewrites of the same path coalesce into one event.
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default log level filter.
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module level overrides.
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

/// The three configuration sections, keyed by event-identifying string.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct EventSections {
    /// Workstation notification name -> handler.
    #[serde(default)]
    pub workspace: BTreeMap<String, EventSpec>,

    /// Dynamic configuration-store key -> handler.
    #[serde(default)]
    pub store: BTreeMap<String, EventSpec>,

    /// Filesystem path -> handler.
    #[serde(default)]
    pub fs: BTreeMap<String, EventSpec>,
}

/// One configuration entry describing how to handle a named event.
///
/// Exactly one field must be populated. Anything else is a configuration
/// error, reported with the offending event key when the entry is resolved.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EventSpec {
    /// A shell command, run with the event context in its environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// The name of a registered function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,

    /// The name of a registered handler class; the method called is named by
    /// the event key itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    /// A `[class, method]` pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<(String, String)>,
}

/// The single action named by a well-formed [`EventSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecAction<'a> {
    Command(&'a str),
    Function(&'a str),
    Class(&'a str),
    Method { class: &'a str, method: &'a str },
}

/// Why an [`EventSpec`] failed the exactly-one-action rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecActionError {
    Missing,
    Ambiguous,
}

impl EventSpec {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }

    pub fn function(name: impl Into<String>) -> Self {
        Self {
            function: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn class(name: impl Into<String>) -> Self {
        Self {
            class: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn method(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            method: Some((class.into(), method.into())),
            ..Self::default()
        }
    }

    /// The one action this spec names, or why it names zero or several.
    pub fn action(&self) -> Result<SpecAction<'_>, SpecActionError> {
        let mut found = None;
        let mut count = 0u8;

        if let Some(command) = &self.command {
            found = Some(SpecAction::Command(command));
            count += 1;
        }
        if let Some(function) = &self.function {
            found = Some(SpecAction::Function(function));
            count += 1;
        }
        if let Some((class, method)) = &self.method {
            found = Some(SpecAction::Method { class, method });
            count += 1;
        }
        if let Some(class) = &self.class {
            found = Some(SpecAction::Class(class));
            count += 1;
        }

        match (found, count) {
            (Some(action), 1) => Ok(action),
            (None, _) => Err(SpecActionError::Missing),
            _ => Err(SpecActionError::Ambiguous),
        }
    }
}

fn default_tick_secs() -> u64 {
    5
}

fn default_coalesce_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    // Interactive runs get debug output, unattended ones stay quieter.
    if std::io::stderr().is_terminal() {
        "debug".to_string()
    } else {
        "info".to_string()
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            coalesce_ms: default_coalesce_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: BTreeMap::new(),
        }
    }
}

const EXAMPLE_CONFIG: &str = r#"# vigild configuration
#
# Each event section maps an event-identifying string to exactly one handler:
#   command  = "shell command"          run with the event context in its env
#   function = "registered.name"        a function registered at startup
#   class    = "RegisteredClass"        method named by the event key
#   method   = ["RegisteredClass", "m"] an explicit [class, method] pair

[daemon]
tick_secs = 5
coalesce_ms = 1000

[logging]
default = "info"

[events.workspace."NSWorkspaceDidWakeNotification"]
command = "/bin/echo 'the system woke from sleep'"

[events.workspace."NSWorkspaceDidMountNotification"]
command = "/bin/echo 'a new volume was mounted'"

[events.store."State:/Network/Global/IPv4"]
command = "/bin/echo 'global IPv4 configuration changed'"

# Filesystem watches fire for any change beneath the configured path.
# The path must exist when the daemon starts.
#
# [events.fs."/etc/postfix"]
# function = "builtin.log"
"#;

impl Settings {
    /// Load settings from a TOML file, layered under `VIGILD_` environment
    /// overrides and over built-in defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("VIGILD_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Write a commented example configuration for the user to customize.
    pub fn write_example(path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::WriteExample {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, EXAMPLE_CONFIG).map_err(write_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_requires_exactly_one_action() {
        assert_eq!(
            EventSpec::default().action(),
            Err(SpecActionError::Missing)
        );

        let mut both = EventSpec::command("/bin/true");
        both.function = Some("builtin.log".to_string());
        assert_eq!(both.action(), Err(SpecActionError::Ambiguous));

        assert_eq!(
            EventSpec::command("/bin/true").action(),
            Ok(SpecAction::Command("/bin/true"))
        );
        assert_eq!(
            EventSpec::method("Mail", "reload").action(),
            Ok(SpecAction::Method {
                class: "Mail",
                method: "reload"
            })
        );
    }

    #[test]
    fn load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[daemon]
tick_secs = 9

[events.fs."/tmp/spool"]
command = "/bin/true"

[events.workspace."DidWake"]
method = ["Power", "woke"]
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.daemon.tick_secs, 9);
        assert_eq!(settings.daemon.coalesce_ms, 1000);
        assert_eq!(
            settings.events.fs.get("/tmp/spool"),
            Some(&EventSpec::command("/bin/true"))
        );
        assert_eq!(
            settings.events.workspace.get("DidWake"),
            Some(&EventSpec::method("Power", "woke"))
        );
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[logging]\ndefault = \"warn\"\n").unwrap();

        // No other test asserts logging.default, so the global env var
        // cannot race a parallel load.
        unsafe { std::env::set_var("VIGILD_LOGGING__DEFAULT", "trace") };
        let settings = Settings::load_from(&path).unwrap();
        unsafe { std::env::remove_var("VIGILD_LOGGING__DEFAULT") };

        assert_eq!(settings.logging.default, "trace");
    }

    #[test]
    fn example_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Settings::write_example(&path).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.events.workspace.len(), 2);
        assert_eq!(settings.events.store.len(), 1);
        assert!(settings.events.fs.is_empty());
        for section in [&settings.events.workspace, &settings.events.store] {
            for spec in section.values() {
                assert!(spec.action().is_ok());
            }
        }
    }
}
