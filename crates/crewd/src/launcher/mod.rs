//! Agent process launcher.
//!
//! Turns a launch request into a running agent CLI process:
//!
//! ```text
//! (intent, project, prompt, options)
//!        │ validate project dir
//!        │ resolve binary                 discovery.rs
//!        │ build args + env
//!        ▼
//!   LaunchSpec ──▶ Spawner::spawn ──▶ SpawnedProcess   process.rs
//! ```
//!
//! The launcher does not read the process output; the registry hands the
//! spawned process to an attachment supervisor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crew_core::{DomainError, Intent, LaunchOptions, LaunchToken, ProjectRef};

use crate::config::DaemonConfig;

pub mod discovery;
pub mod process;

pub use discovery::{BinaryDiscovery, BinarySource, DetectedBinary, Invocation};
pub use process::{ExitInfo, LaunchSpec, ProcessControl, SpawnedProcess, Spawner, TokioSpawner};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised before a process is running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("Agent binary not found (searched {} locations)", searched.len())]
    BinaryNotFound { searched: Vec<PathBuf> },

    #[error("Failed to spawn {program}: {message}")]
    SpawnFailed { program: String, message: String },

    #[error("Invalid project path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
}

impl From<DomainError> for LaunchError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidPath { path, reason } => Self::InvalidPath { path, reason },
            other => Self::InvalidPath {
                path: String::new(),
                reason: other.to_string(),
            },
        }
    }
}

// ============================================================================
// Arguments
// ============================================================================

/// Agent CLI arguments for one attachment.
///
/// `[-c | --resume <id>] -p <prompt> [--model <m>] --output-format stream-json
/// --include-partial-messages --verbose [--dangerously-skip-permissions] [extra…]`
pub fn build_args(intent: &Intent, prompt: &str, options: &LaunchOptions) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(12 + options.extra_args.len());

    match intent {
        Intent::New => {}
        Intent::Continue => args.push("-c".to_string()),
        Intent::Resume(session_id) => {
            args.push("--resume".to_string());
            args.push(session_id.to_string());
        }
    }

    args.push("-p".to_string());
    args.push(prompt.to_string());

    if let Some(model) = options.model.as_deref().filter(|m| !m.trim().is_empty()) {
        args.push("--model".to_string());
        args.push(model.to_string());
    }

    args.extend(
        [
            "--output-format",
            "stream-json",
            "--include-partial-messages",
            "--verbose",
        ]
        .map(String::from),
    );

    if options.skip_permissions {
        args.push("--dangerously-skip-permissions".to_string());
    }

    args.extend(options.extra_args.iter().cloned());
    args
}

/// Environment additions for the child: augmented `PATH`, default `TERM`.
pub fn build_env(
    lookup: impl Fn(&str) -> Option<String>,
    extra_dirs: &[PathBuf],
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    let current = lookup("PATH").unwrap_or_default();
    let mut dirs: Vec<PathBuf> = extra_dirs.to_vec();
    dirs.extend(std::env::split_paths(&current));
    let mut seen = Vec::new();
    dirs.retain(|dir| {
        if seen.contains(dir) {
            false
        } else {
            seen.push(dir.clone());
            true
        }
    });
    if let Ok(path) = std::env::join_paths(dirs) {
        env.insert("PATH".to_string(), path.to_string_lossy().to_string());
    }

    if lookup("TERM").filter(|t| !t.is_empty()).is_none() {
        env.insert("TERM".to_string(), "xterm-256color".to_string());
    }
    env
}

// ============================================================================
// Launcher
// ============================================================================

/// A freshly started attachment.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub token: LaunchToken,
    pub spawned: SpawnedProcess,
    pub program: PathBuf,
}

/// Resolves the agent binary and spawns attachments.
///
/// The persisted override is re-read from the config file on every launch.
/// A binary found by lookup is reused until it disappears or fails to spawn.
pub struct Launcher {
    discovery: BinaryDiscovery,
    spawner: Arc<dyn Spawner>,
    pinned: Option<PathBuf>,
    config_file: Option<PathBuf>,
    discovered: Mutex<Option<PathBuf>>,
    default_model: Option<String>,
}

impl Launcher {
    pub fn new(discovery: BinaryDiscovery, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            discovery,
            spawner,
            pinned: None,
            config_file: None,
            discovered: Mutex::new(None),
            default_model: None,
        }
    }

    /// Skips discovery and always runs `program`.
    pub fn with_binary(program: impl Into<PathBuf>, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            pinned: Some(program.into()),
            ..Self::new(BinaryDiscovery::new("claude").with_home(None), spawner)
        }
    }

    /// Reads the `binary_path` override from `path` before each launch.
    #[must_use]
    pub fn with_config_file(mut self, path: Option<PathBuf>) -> Self {
        self.config_file = path;
        self
    }

    #[must_use]
    pub fn with_default_model(mut self, model: Option<String>) -> Self {
        self.default_model = model;
        self
    }

    /// Validates the project, resolves the binary and spawns the agent.
    pub async fn launch(
        &self,
        intent: &Intent,
        project: &ProjectRef,
        prompt: &str,
        options: &LaunchOptions,
    ) -> Result<LaunchedProcess, LaunchError> {
        let cwd = project.host_path();
        let is_dir = tokio::fs::metadata(&cwd)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(LaunchError::InvalidPath {
                path: project.path.clone(),
                reason: "not an existing directory".to_string(),
            });
        }

        let binary = self.binary().await?;
        let invocation = discovery::resolve_invocation(&binary);

        let mut options = options.clone();
        if options.model.is_none() {
            options.model = self.default_model.clone();
        }

        let mut args = invocation.args;
        args.extend(build_args(intent, prompt, &options));

        let spec = LaunchSpec {
            program: invocation.program,
            args,
            cwd,
            env: build_env(
                |key| std::env::var(key).ok(),
                &discovery::extra_path_dirs(dirs::home_dir().as_deref()),
            ),
        };

        let token = LaunchToken::generate();
        debug!(
            token = %token,
            intent = %intent,
            program = %spec.program.display(),
            "Launching agent"
        );
        let spawned = match self.spawner.spawn(&spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.forget_discovered(&binary).await;
                return Err(e);
            }
        };
        info!(
            token = %token,
            intent = %intent,
            project = %project.path,
            pid = ?spawned.pid,
            "Agent process started"
        );

        Ok(LaunchedProcess {
            token,
            spawned,
            program: spec.program,
        })
    }

    /// Binary for the next launch.
    pub async fn binary(&self) -> Result<PathBuf, LaunchError> {
        if let Some(program) = &self.pinned {
            return Ok(program.clone());
        }

        let discovery = self.current_discovery().await;
        let mut discovered = self.discovered.lock().await;

        let check = discovery.clone();
        let previous = discovered.clone();
        let (explicit, previous_ok) = tokio::task::spawn_blocking(move || {
            let explicit = check.explicit_override();
            let previous_ok = previous.as_deref().is_some_and(Path::is_file);
            (explicit, previous_ok)
        })
        .await
        .unwrap_or((None, false));

        if let Some(found) = explicit {
            return Ok(found.path);
        }
        if previous_ok {
            if let Some(path) = discovered.as_ref() {
                return Ok(path.clone());
            }
        }
        if let Some(stale) = discovered.take() {
            info!(path = %stale.display(), "Agent binary is gone, searching again");
        }

        let found = discovery.resolve().await?;
        *discovered = Some(found.path.clone());
        Ok(found.path)
    }

    /// Discovery with the override currently persisted in the config file.
    async fn current_discovery(&self) -> BinaryDiscovery {
        let Some(path) = self.config_file.clone() else {
            return self.discovery.clone();
        };
        let loaded = tokio::task::spawn_blocking(move || DaemonConfig::load_from(&path)).await;
        match loaded {
            Ok(Ok(config)) => self.discovery.clone().with_config_override(config.binary_path),
            Ok(Err(e)) => {
                warn!(
                    error = %e,
                    "Could not re-read the config file, using the startup override"
                );
                self.discovery.clone()
            }
            Err(e) => {
                warn!(error = %e, "Config reload task failed");
                self.discovery.clone()
            }
        }
    }

    async fn forget_discovered(&self, program: &Path) {
        let mut discovered = self.discovered.lock().await;
        if discovered.as_deref() == Some(program) {
            debug!(path = %program.display(), "Dropping binary that failed to spawn");
            *discovered = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crew_core::SessionId;

    #[test]
    fn test_args_for_new_session() {
        let args = build_args(&Intent::New, "fix the bug", &LaunchOptions::default());
        assert_eq!(
            args,
            vec![
                "-p",
                "fix the bug",
                "--output-format",
                "stream-json",
                "--include-partial-messages",
                "--verbose",
            ]
        );
    }

    #[test]
    fn test_args_for_continue_and_resume() {
        let options = LaunchOptions::default().with_model("opus");
        let cont = build_args(&Intent::Continue, "more", &options);
        assert_eq!(cont.first().map(String::as_str), Some("-c"));
        assert!(cont.windows(2).any(|w| w == ["--model", "opus"]));

        let resume = build_args(&Intent::Resume(SessionId::new("abc")), "again", &options);
        assert_eq!(&resume[..4], ["--resume", "abc", "-p", "again"]);
    }

    #[test]
    fn test_args_with_permissions_and_extra() {
        let options = LaunchOptions {
            skip_permissions: true,
            extra_args: vec!["--think".to_string()],
            ..LaunchOptions::default()
        };
        let args = build_args(&Intent::New, "x", &options);
        let tail: Vec<&str> = args.iter().rev().take(2).map(String::as_str).collect();
        assert_eq!(tail, vec!["--think", "--dangerously-skip-permissions"]);
    }

    #[test]
    fn test_blank_model_is_ignored() {
        let options = LaunchOptions::default().with_model("  ");
        assert!(!build_args(&Intent::New, "x", &options).contains(&"--model".to_string()));
    }

    #[test]
    fn test_env_sets_term_and_prepends_path() {
        let dir = tempfile::tempdir().unwrap();
        let extra = dir.path().to_path_buf();
        let env = build_env(
            |key| (key == "PATH").then(|| "/usr/bin".to_string()),
            std::slice::from_ref(&extra),
        );
        assert_eq!(env.get("TERM").map(String::as_str), Some("xterm-256color"));
        let path = env.get("PATH").unwrap();
        let parts: Vec<PathBuf> = std::env::split_paths(path).collect();
        assert_eq!(parts, vec![extra, PathBuf::from("/usr/bin")]);
    }

    #[test]
    fn test_env_keeps_existing_term() {
        let env = build_env(
            |key| (key == "TERM").then(|| "screen".to_string()),
            &[],
        );
        assert!(!env.contains_key("TERM"));
    }

    #[tokio::test]
    async fn test_launch_rejects_missing_directory() {
        let launcher = Launcher::with_binary("/bin/true", Arc::new(TokioSpawner));
        let project = ProjectRef::new("/definitely/not/here/crew").unwrap();
        let err = launcher
            .launch(&Intent::New, &project, "hi", &LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn test_launch_rejects_file_as_project() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "not a directory").unwrap();

        let launcher = Launcher::with_binary("/bin/true", Arc::new(TokioSpawner));
        let project = ProjectRef::new(file.display().to_string()).unwrap();
        let err = launcher
            .launch(&Intent::New, &project, "hi", &LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn test_binary_override_is_reread_on_each_launch() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("agent-one");
        let second = dir.path().join("agent-two");
        std::fs::write(&first, "#!/bin/sh\n").unwrap();
        std::fs::write(&second, "#!/bin/sh\n").unwrap();
        let config = dir.path().join("config.toml");
        DaemonConfig::set_binary_override(&config, Some(first.clone())).unwrap();

        let launcher = Launcher::new(
            BinaryDiscovery::new("crew-test-no-such-binary").with_home(None),
            Arc::new(TokioSpawner),
        )
        .with_config_file(Some(config.clone()));
        assert_eq!(launcher.binary().await.unwrap(), first);

        DaemonConfig::set_binary_override(&config, Some(second.clone())).unwrap();
        assert_eq!(launcher.binary().await.unwrap(), second);

        DaemonConfig::set_binary_override(&config, None).unwrap();
        assert!(matches!(
            launcher.binary().await,
            Err(LaunchError::BinaryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_removed_binary_is_searched_again() {
        let home = tempfile::tempdir().unwrap();
        let local = home.path().join(".local").join("bin");
        let bun = home.path().join(".bun").join("bin");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(&bun).unwrap();
        std::fs::write(local.join("crew-test-agent"), "#!/bin/sh\n").unwrap();

        let launcher = Launcher::new(
            BinaryDiscovery::new("crew-test-agent").with_home(Some(home.path().to_path_buf())),
            Arc::new(TokioSpawner),
        );
        assert_eq!(launcher.binary().await.unwrap(), local.join("crew-test-agent"));

        std::fs::remove_file(local.join("crew-test-agent")).unwrap();
        std::fs::write(bun.join("crew-test-agent"), "#!/bin/sh\n").unwrap();
        assert_eq!(launcher.binary().await.unwrap(), bun.join("crew-test-agent"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_forgets_discovered_binary() {
        let home = tempfile::tempdir().unwrap();
        let local = home.path().join(".local").join("bin");
        std::fs::create_dir_all(&local).unwrap();
        // Neither executable nor a script.
        std::fs::write(local.join("crew-test-agent"), "plain text").unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let project = ProjectRef::new(project_dir.path().display().to_string()).unwrap();

        let launcher = Launcher::new(
            BinaryDiscovery::new("crew-test-agent").with_home(Some(home.path().to_path_buf())),
            Arc::new(TokioSpawner),
        );
        let err = launcher
            .launch(&Intent::New, &project, "hi", &LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::SpawnFailed { .. }));
        assert_eq!(*launcher.discovered.lock().await, None);
    }

    #[test]
    fn test_domain_error_maps_to_invalid_path() {
        let err: LaunchError = ProjectRef::new("relative").unwrap_err().into();
        assert!(matches!(err, LaunchError::InvalidPath { path, .. } if path == "relative"));
    }
}
