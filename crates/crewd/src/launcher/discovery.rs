//! Agent binary discovery.
//!
//! Resolution order:
//!
//! ```text
//! binary_path (config file) ─▶ CREW_AGENT_BINARY ─▶ which(binary_name)
//!        ─▶ well-known install locations ─▶ BinaryNotFound
//! ```
//!
//! Explicit overrides win outright. When lookup finds several
//! installations, each is probed with `--version` and the newest wins;
//! ties keep lookup order.

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use super::LaunchError;
use crate::config::DaemonConfig;

/// Upper bound for one `--version` probe.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Where a binary candidate was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySource {
    ConfigOverride,
    EnvOverride,
    PathLookup,
    StandardLocation,
}

impl fmt::Display for BinarySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ConfigOverride => "config",
            Self::EnvOverride => "env",
            Self::PathLookup => "PATH",
            Self::StandardLocation => "standard location",
        };
        f.write_str(label)
    }
}

/// An installation of the agent CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedBinary {
    pub path: PathBuf,
    pub version: Option<String>,
    pub source: BinarySource,
}

/// Program and leading arguments needed to run a binary, after shim handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

// ============================================================================
// Discovery
// ============================================================================

/// Finds the agent executable.
#[derive(Debug, Clone)]
pub struct BinaryDiscovery {
    config_override: Option<PathBuf>,
    env_override: Option<PathBuf>,
    binary_name: String,
    home: Option<PathBuf>,
}

impl BinaryDiscovery {
    pub fn new(binary_name: impl Into<String>) -> Self {
        Self {
            config_override: None,
            env_override: None,
            binary_name: binary_name.into(),
            home: dirs::home_dir(),
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            config_override: config.binary_path.clone(),
            env_override: config.env_binary.clone(),
            ..Self::new(config.binary_name.clone())
        }
    }

    #[must_use]
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    #[must_use]
    pub fn with_config_override(mut self, path: Option<PathBuf>) -> Self {
        self.config_override = path;
        self
    }

    #[must_use]
    pub fn with_env_override(mut self, path: Option<PathBuf>) -> Self {
        self.env_override = path;
        self
    }

    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    /// Picks the binary to launch.
    pub async fn resolve(&self) -> Result<DetectedBinary, LaunchError> {
        if let Some(found) = self.explicit_override() {
            info!(
                path = %found.path.display(),
                source = %found.source,
                "Using agent binary override"
            );
            return Ok(found);
        }

        let mut candidates = self.lookup_candidates();
        match candidates.len() {
            0 => Err(LaunchError::BinaryNotFound {
                searched: self.searched_locations(),
            }),
            1 => Ok(candidates.remove(0)),
            _ => {
                for candidate in &mut candidates {
                    candidate.version = probe_version(&candidate.path).await;
                }
                let best = pick_newest(candidates).ok_or_else(|| LaunchError::BinaryNotFound {
                    searched: self.searched_locations(),
                })?;
                info!(
                    path = %best.path.display(),
                    version = ?best.version,
                    "Selected newest agent installation"
                );
                Ok(best)
            }
        }
    }

    /// Every installation found, with versions probed. Used by `crewd discover`.
    pub async fn discover_all(&self) -> Vec<DetectedBinary> {
        let mut all: Vec<DetectedBinary> = self.explicit_overrides();
        for candidate in self.lookup_candidates() {
            if !all.iter().any(|known| known.path == candidate.path) {
                all.push(candidate);
            }
        }
        for candidate in &mut all {
            candidate.version = probe_version(&candidate.path).await;
        }
        all
    }

    pub(crate) fn explicit_override(&self) -> Option<DetectedBinary> {
        self.explicit_overrides().into_iter().next()
    }

    fn explicit_overrides(&self) -> Vec<DetectedBinary> {
        let mut found = Vec::new();
        if let Some(path) = &self.config_override {
            if path.is_file() {
                found.push(DetectedBinary {
                    path: path.clone(),
                    version: None,
                    source: BinarySource::ConfigOverride,
                });
            } else {
                warn!(path = %path.display(), "Configured agent binary is not a file, ignoring");
            }
        }
        if let Some(path) = &self.env_override {
            if path.is_file() {
                found.push(DetectedBinary {
                    path: path.clone(),
                    version: None,
                    source: BinarySource::EnvOverride,
                });
            } else {
                warn!(path = %path.display(), "CREW_AGENT_BINARY is not a file, ignoring");
            }
        }
        found
    }

    /// PATH hit first, then existing well-known locations, without duplicates.
    fn lookup_candidates(&self) -> Vec<DetectedBinary> {
        let mut candidates: Vec<DetectedBinary> = Vec::new();

        if let Ok(path) = which::which(&self.binary_name) {
            debug!(path = %path.display(), "Found agent binary on PATH");
            candidates.push(DetectedBinary {
                path,
                version: None,
                source: BinarySource::PathLookup,
            });
        }

        for path in standard_locations(&self.binary_name, self.home.as_deref()) {
            if !path.is_file() || candidates.iter().any(|c| same_file(&c.path, &path)) {
                continue;
            }
            debug!(path = %path.display(), "Found agent binary in standard location");
            candidates.push(DetectedBinary {
                path,
                version: None,
                source: BinarySource::StandardLocation,
            });
        }
        candidates
    }

    fn searched_locations(&self) -> Vec<PathBuf> {
        let mut searched: Vec<PathBuf> = self
            .config_override
            .iter()
            .chain(self.env_override.iter())
            .cloned()
            .collect();
        searched.push(PathBuf::from(format!("$PATH/{}", self.binary_name)));
        searched.extend(standard_locations(&self.binary_name, self.home.as_deref()));
        searched
    }
}

/// Candidate install paths, most conventional first.
pub fn standard_locations(binary_name: &str, home: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if cfg!(windows) {
        let cmd = format!("{binary_name}.cmd");
        let exe = format!("{binary_name}.exe");
        if let Some(appdata) = std::env::var_os("APPDATA") {
            paths.push(PathBuf::from(appdata).join("npm").join(&cmd));
        }
        if let Some(home) = home {
            paths.push(home.join("AppData").join("Roaming").join("npm").join(&cmd));
            paths.push(home.join("AppData").join("Local").join("Yarn").join("bin").join(&cmd));
            paths.push(home.join(".bun").join("bin").join(&exe));
            paths.push(home.join(".claude").join("local").join(&exe));
        }
        return paths;
    }

    paths.push(PathBuf::from("/usr/local/bin").join(binary_name));
    paths.push(PathBuf::from("/opt/homebrew/bin").join(binary_name));
    if let Some(home) = home {
        paths.push(home.join(".local").join("bin").join(binary_name));
        paths.push(home.join(".claude").join("local").join(binary_name));
        paths.push(home.join(".npm-global").join("bin").join(binary_name));
        paths.push(home.join(".bun").join("bin").join(binary_name));
        paths.extend(nvm_locations(binary_name, home));
    }
    paths
}

/// `~/.nvm/versions/node/*/bin/<name>`, newest node version first.
fn nvm_locations(binary_name: &str, home: &Path) -> Vec<PathBuf> {
    let root = home.join(".nvm").join("versions").join("node");
    let Ok(entries) = fs::read_dir(&root) else {
        return Vec::new();
    };
    let mut versions: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    versions.sort_by_key(|dir| std::cmp::Reverse(version_key(&dir_name(dir))));
    versions
        .into_iter()
        .map(|dir| dir.join("bin").join(binary_name))
        .collect()
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Directories worth adding to a child's `PATH` so shims find their runtime.
pub fn extra_path_dirs(home: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = vec![
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/opt/homebrew/bin"),
    ];
    if let Some(home) = home {
        dirs.push(home.join(".local").join("bin"));
        dirs.push(home.join(".npm-global").join("bin"));
        dirs.push(home.join(".bun").join("bin"));
    }
    dirs.retain(|dir| dir.is_dir());
    dirs
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

// ============================================================================
// Versions
// ============================================================================

/// Runs `<path> --version` and returns the first non-empty line.
pub async fn probe_version(path: &Path) -> Option<String> {
    let invocation = resolve_invocation(path);
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .arg("--version")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(VERSION_PROBE_TIMEOUT, command.output()).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(_)) | Ok(Err(_)) => {
            debug!(path = %path.display(), "Version probe failed");
            return None;
        }
        Err(_) => {
            warn!(path = %path.display(), "Version probe timed out");
            return None;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = stdout.lines().map(str::trim).find(|line| !line.is_empty())?;
    debug!(path = %path.display(), version, "Detected agent version");
    Some(version.to_string())
}

/// Numeric components of the first dotted number in `text`.
///
/// `"1.0.72 (Claude Code)"` gives `[1, 0, 72]`; `"v18.2"` gives `[18, 2]`.
pub fn version_key(text: &str) -> Vec<u64> {
    let start = text.find(|c: char| c.is_ascii_digit());
    let Some(start) = start else {
        return Vec::new();
    };
    let rest = text.get(start..).unwrap_or_default();
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest.get(..end)
        .unwrap_or_default()
        .split('.')
        .filter_map(|part| part.parse().ok())
        .collect()
}

fn compare_versions(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => version_key(a).cmp(&version_key(b)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

/// Newest candidate; the earliest wins ties.
fn pick_newest(candidates: Vec<DetectedBinary>) -> Option<DetectedBinary> {
    candidates.into_iter().fold(None, |best, candidate| match best {
        None => Some(candidate),
        Some(best) => {
            if compare_versions(candidate.version.as_deref(), best.version.as_deref())
                == Ordering::Greater
            {
                Some(candidate)
            } else {
                Some(best)
            }
        }
    })
}

// ============================================================================
// Shims
// ============================================================================

/// Works out how to execute `path`.
///
/// `.cmd`/`.bat` shims run through `cmd.exe /C`. On Unix a file without
/// execute permission that starts with `#!` runs through its interpreter,
/// or `sh` when the interpreter is missing.
pub fn resolve_invocation(path: &Path) -> Invocation {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    if matches!(extension.as_deref(), Some("cmd") | Some("bat")) {
        return Invocation {
            program: PathBuf::from("cmd.exe"),
            args: vec!["/C".to_string(), path.display().to_string()],
        };
    }

    #[cfg(unix)]
    {
        if !is_executable(path) {
            if let Some(invocation) = shebang_invocation(path) {
                return invocation;
            }
        }
    }

    Invocation {
        program: path.to_path_buf(),
        args: Vec::new(),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(unix)]
fn shebang_invocation(path: &Path) -> Option<Invocation> {
    use std::io::{BufRead, BufReader};

    let file = fs::File::open(path).ok()?;
    let mut first_line = String::new();
    BufReader::new(file).read_line(&mut first_line).ok()?;
    let interpreter_line = first_line.strip_prefix("#!")?.trim();
    let script = path.display().to_string();

    let mut parts = interpreter_line.split_whitespace();
    let interpreter = parts.next().map(PathBuf::from);
    match interpreter {
        Some(interpreter) if interpreter.is_file() => {
            let mut args: Vec<String> = parts.map(str::to_string).collect();
            args.push(script);
            Some(Invocation {
                program: interpreter,
                args,
            })
        }
        _ => Some(Invocation {
            program: PathBuf::from("sh"),
            args: vec![script],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_version_key() {
        assert_eq!(version_key("1.0.72 (Claude Code)"), vec![1, 0, 72]);
        assert_eq!(version_key("v18.2"), vec![18, 2]);
        assert!(version_key("unknown").is_empty());
        assert!(version_key("2.0.1") > version_key("1.9.99"));
    }

    #[test]
    fn test_pick_newest_prefers_versioned_then_first() {
        let make = |path: &str, version: Option<&str>| DetectedBinary {
            path: PathBuf::from(path),
            version: version.map(str::to_string),
            source: BinarySource::StandardLocation,
        };
        let best = pick_newest(vec![
            make("/a", Some("1.0.5")),
            make("/b", Some("1.0.40")),
            make("/c", None),
            make("/d", Some("1.0.40")),
        ]);
        assert_eq!(best.map(|b| b.path), Some(PathBuf::from("/b")));
    }

    #[test]
    fn test_cmd_shims_run_through_cmd_exe() {
        let invocation = resolve_invocation(Path::new(r"C:\npm\claude.CMD"));
        assert_eq!(invocation.program, PathBuf::from("cmd.exe"));
        assert_eq!(invocation.args.first().map(String::as_str), Some("/C"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_script_uses_shebang() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("claude");
        touch(&script, "#!/bin/sh\necho hi\n");

        let invocation = resolve_invocation(&script);
        assert_eq!(invocation.program, PathBuf::from("/bin/sh"));
        assert_eq!(invocation.args, vec![script.display().to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_interpreter_falls_back_to_sh() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("claude");
        touch(&script, "#!/no/such/interpreter --flag\n");

        let invocation = resolve_invocation(&script);
        assert_eq!(invocation.program, PathBuf::from("sh"));
    }

    #[cfg(unix)]
    #[test]
    fn test_standard_locations_include_nvm_newest_first() {
        let dir = tempdir().unwrap();
        let home = dir.path();
        fs::create_dir_all(home.join(".nvm/versions/node/v18.2.0/bin")).unwrap();
        fs::create_dir_all(home.join(".nvm/versions/node/v20.1.0/bin")).unwrap();
        fs::create_dir_all(home.join(".nvm/versions/node/v9.11.0/bin")).unwrap();

        let locations = standard_locations("claude", Some(home));
        let nvm: Vec<String> = locations
            .iter()
            .filter(|p| p.to_string_lossy().contains(".nvm"))
            .filter_map(|p| p.parent()?.parent()?.file_name())
            .map(|name| name.to_string_lossy().to_string())
            .collect();
        assert_eq!(nvm, vec!["v20.1.0", "v18.2.0", "v9.11.0"]);
        assert!(locations.contains(&home.join(".claude/local/claude")));
    }

    #[tokio::test]
    async fn test_config_override_wins() {
        let dir = tempdir().unwrap();
        let configured = dir.path().join("configured");
        let from_env = dir.path().join("from-env");
        touch(&configured, "");
        touch(&from_env, "");

        let discovery = BinaryDiscovery::new("crew-test-no-such-binary")
            .with_home(None)
            .with_config_override(Some(configured.clone()))
            .with_env_override(Some(from_env));
        let found = discovery.resolve().await.unwrap();
        assert_eq!(found.path, configured);
        assert_eq!(found.source, BinarySource::ConfigOverride);
    }

    #[tokio::test]
    async fn test_missing_override_falls_through_to_env() {
        let dir = tempdir().unwrap();
        let from_env = dir.path().join("from-env");
        touch(&from_env, "");

        let discovery = BinaryDiscovery::new("crew-test-no-such-binary")
            .with_home(None)
            .with_config_override(Some(dir.path().join("gone")))
            .with_env_override(Some(from_env.clone()));
        let found = discovery.resolve().await.unwrap();
        assert_eq!(found.path, from_env);
        assert_eq!(found.source, BinarySource::EnvOverride);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_standard_location_found_under_home() {
        let dir = tempdir().unwrap();
        let installed = dir.path().join(".claude/local/crew-test-agent");
        touch(&installed, "#!/bin/sh\n");

        let discovery =
            BinaryDiscovery::new("crew-test-agent").with_home(Some(dir.path().to_path_buf()));
        let found = discovery.resolve().await.unwrap();
        assert_eq!(found.path, installed);
        assert_eq!(found.source, BinarySource::StandardLocation);
    }

    #[tokio::test]
    async fn test_not_found_lists_searched_locations() {
        let discovery = BinaryDiscovery::new("crew-test-no-such-binary").with_home(None);
        match discovery.resolve().await {
            Err(LaunchError::BinaryNotFound { searched }) => assert!(!searched.is_empty()),
            other => panic!("expected BinaryNotFound, got {other:?}"),
        }
    }
}
