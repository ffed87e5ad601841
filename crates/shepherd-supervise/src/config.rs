//! Application registration input and config resolution.

use serde::{Deserialize, Serialize};
use shepherd_common::{AppId, Error, Result};
use shepherd_store::{AppConfig, AppMode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Options of the supervisor itself.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Directory under which per-application storage (logs, port files) is
    /// created.
    pub base_path: PathBuf,
}

impl SupervisorOptions {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

/// How callers refer to an application.
#[derive(Debug, Clone)]
pub enum AppRef {
    Id(AppId),
    Name(String),
    /// A full definition; registers the application if the name is unknown.
    Config(AppDefinition),
}

impl From<AppId> for AppRef {
    fn from(id: AppId) -> Self {
        AppRef::Id(id)
    }
}

impl From<&str> for AppRef {
    fn from(name: &str) -> Self {
        AppRef::Name(name.to_string())
    }
}

impl From<AppDefinition> for AppRef {
    fn from(definition: AppDefinition) -> Self {
        AppRef::Config(definition)
    }
}

/// Caller-supplied application definition. Every field except `path` is
/// optional; [`prepare_config`] resolves the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppDefinition {
    pub path: Option<PathBuf>,
    pub name: Option<String>,
    pub interpreter: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub mode: Option<AppMode>,
    pub instances: Option<u32>,
    pub autorestart: Option<bool>,
    pub max_restarts: Option<u32>,
    pub restart_delay_ms: Option<u64>,
    pub kill_timeout_ms: Option<u64>,
    pub normal_start_ms: Option<u64>,
    pub startup: Option<bool>,
}

impl AppDefinition {
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Overlay the set fields of this definition onto an existing config.
    /// Identity fields (`id`, `name`, derived storage paths) are untouched.
    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(path) = &self.path {
            config.path = path.clone();
        }
        if let Some(interpreter) = &self.interpreter {
            config.interpreter = interpreter.clone();
        }
        if let Some(args) = &self.args {
            config.args = args.clone();
        }
        if let Some(env) = &self.env {
            config.env = env.clone();
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(instances) = self.instances {
            config.instances = instances;
        }
        if let Some(autorestart) = self.autorestart {
            config.autorestart = autorestart;
        }
        if let Some(max_restarts) = self.max_restarts {
            config.max_restarts = max_restarts;
        }
        if let Some(restart_delay_ms) = self.restart_delay_ms {
            config.restart_delay_ms = restart_delay_ms;
        }
        if let Some(kill_timeout_ms) = self.kill_timeout_ms {
            config.kill_timeout_ms = kill_timeout_ms;
        }
        if let Some(normal_start_ms) = self.normal_start_ms {
            config.normal_start_ms = normal_start_ms;
        }
        if let Some(startup) = self.startup {
            config.startup = startup;
        }
    }
}

/// How a process is asked to stop.
#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    /// Ask the container to shut down first; force-kill only after the
    /// timeout elapses.
    pub graceful: bool,
    pub timeout_ms: u64,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            graceful: true,
            timeout_ms: 2_000,
        }
    }
}

impl StopOptions {
    pub fn force() -> Self {
        Self {
            graceful: false,
            timeout_ms: 0,
        }
    }
}

fn interpreter_for(path: &Path) -> Result<String> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("js") | Some("mjs") => Ok("node".to_string()),
        Some(other) => Err(Error::invalid_argument(format!(
            "no default interpreter for '.{other}' scripts, set one explicitly"
        ))),
        None => Err(Error::invalid_argument(
            "cannot infer an interpreter for a script without an extension",
        )),
    }
}

fn default_instances() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Resolve a caller-supplied definition into a fully defaulted [`AppConfig`].
///
/// `path` is mandatory. The name defaults to the script's file stem, the
/// interpreter is inferred from the extension, and cluster mode is only
/// accepted for node scripts since worker forking happens inside the node
/// container.
pub fn prepare_config(
    definition: &AppDefinition,
    id: AppId,
    options: &SupervisorOptions,
) -> Result<AppConfig> {
    let path = definition
        .path
        .clone()
        .ok_or_else(|| Error::invalid_argument("application path is required"))?;

    let name = match &definition.name {
        Some(name) if !name.is_empty() => name.clone(),
        _ => path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "cannot derive a name from path '{}'",
                    path.display()
                ))
            })?,
    };

    let interpreter = match &definition.interpreter {
        Some(interpreter) => interpreter.clone(),
        None => interpreter_for(&path)?,
    };

    let mode = definition.mode.unwrap_or_default();
    if mode == AppMode::Cluster && interpreter != "node" {
        return Err(Error::configuration(
            &name,
            "cluster mode is only supported for node applications",
        ));
    }

    let storage = options.base_path.join(&name);
    Ok(AppConfig {
        id,
        name,
        path,
        interpreter,
        args: definition.args.clone().unwrap_or_default(),
        env: definition.env.clone().unwrap_or_default(),
        mode,
        instances: definition.instances.unwrap_or_else(default_instances),
        autorestart: definition.autorestart.unwrap_or(false),
        max_restarts: definition.max_restarts.unwrap_or(3),
        restart_delay_ms: definition.restart_delay_ms.unwrap_or(0),
        kill_timeout_ms: definition.kill_timeout_ms.unwrap_or(1_600),
        normal_start_ms: definition.normal_start_ms.unwrap_or(1_000),
        startup: definition.startup.unwrap_or(false),
        stdout: storage.join("stdout.log"),
        stderr: storage.join("stderr.log"),
        port: storage.join("port.sock"),
        storage,
    })
}
