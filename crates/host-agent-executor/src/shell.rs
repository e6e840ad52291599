//! Shell and executable resolution.

use std::{
    collections::HashSet,
    env::{join_paths, split_paths},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{process::Command, sync::OnceCell};

/// Timeout for asking a login shell for its PATH.
const PATH_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Returns the shell program and its "run this string" argument.
///
/// - Windows: `("cmd", "/C")`
/// - Unix-like: the user's `$SHELL`, or `/bin/sh`, with `-c`
#[must_use]
pub fn get_shell_command() -> (String, &'static str) {
    if cfg!(windows) {
        ("cmd".into(), "/C")
    } else {
        UnixShell::current_shell().get_shell_command()
    }
}

/// Resolve an executable by name.
///
/// The search order is:
/// 1. Explicit absolute paths.
/// 2. The agent's own PATH via `which`.
/// 3. The PATH a login shell reports, queried once per process.
///
/// The agent's environment is never modified.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    if let Some(found) = which_async(executable, None).await {
        return Some(found);
    }

    let login_path = login_shell_path().await.as_ref()?;
    which_async(executable, Some(login_path.clone())).await
}

/// Merge two PATH strings into a single, de-duplicated PATH.
#[must_use]
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let mut merged = Vec::<PathBuf>::new();

    for p in split_paths(primary.as_ref()).chain(split_paths(secondary.as_ref())) {
        if !p.as_os_str().is_empty() && seen.insert(p.clone()) {
            merged.push(p);
        }
    }

    join_paths(merged).unwrap_or_default()
}

async fn login_shell_path() -> &'static Option<OsString> {
    static LOGIN_PATH: OnceCell<Option<OsString>> = OnceCell::const_new();
    LOGIN_PATH
        .get_or_init(|| async {
            let fresh = get_fresh_path().await?;
            let existing = std::env::var_os("PATH").unwrap_or_default();
            let merged = merge_paths(&existing, OsString::from(&fresh));
            tracing::debug!(?merged, "resolved login shell PATH");
            Some(merged)
        })
        .await
}

async fn which_async(executable: &str, path: Option<OsString>) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || match path {
        Some(path) => {
            let cwd = std::env::current_dir().ok()?;
            which::which_in(executable, Some(path), cwd).ok()
        }
        None => which::which(executable).ok(),
    })
    .await
    .ok()
    .flatten()
}

/// Unix shell types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixShell {
    Zsh(PathBuf),
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    /// Get the shell path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Whether this shell supports login mode.
    #[must_use]
    pub const fn login(&self) -> bool {
        matches!(self, Self::Zsh(_) | Self::Bash(_))
    }

    /// Get the current shell from `$SHELL`.
    #[must_use]
    pub fn current_shell() -> Self {
        if let Ok(shell) = std::env::var("SHELL") {
            if let Some(shell) = Self::from_path(Path::new(&shell)) {
                return shell;
            }
        }
        Self::Sh(PathBuf::from("/bin/sh"))
    }

    /// Create from a path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if !(path.is_absolute() && path.is_file()) {
            return None;
        }
        let path_buf = path.to_path_buf();
        let shell = match path.file_name().and_then(OsStr::to_str) {
            Some("zsh") => Self::Zsh(path_buf),
            Some("bash") => Self::Bash(path_buf),
            Some("sh") => Self::Sh(path_buf),
            _ => Self::Other(path_buf),
        };
        Some(shell)
    }

    /// Get shell command tuple.
    #[must_use]
    pub fn get_shell_command(&self) -> (String, &'static str) {
        (self.path().to_string_lossy().into_owned(), "-c")
    }
}

#[cfg(not(windows))]
async fn get_fresh_path() -> Option<String> {
    let shell = UnixShell::current_shell();
    let mut cmd = Command::new(shell.path());
    if shell.login() {
        cmd.arg("-l");
    }
    cmd.arg("-c")
        .arg("printf '%s' \"$PATH\"")
        .env("TERM", "dumb")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = cmd.spawn().ok()?;
    let output = match tokio::time::timeout(PATH_REFRESH_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            tracing::debug!(
                shell = %shell.path().display(),
                ?err,
                "Failed to retrieve PATH from login shell"
            );
            return None;
        }
        Err(_) => {
            tracing::warn!(
                shell = %shell.path().display(),
                "Timed out retrieving PATH from login shell"
            );
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8(output.stdout).ok()?.trim().to_string();
    if path.is_empty() { None } else { Some(path) }
}

#[cfg(windows)]
async fn get_fresh_path() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_paths_dedupes() {
        let merged = merge_paths("/usr/bin:/bin", "/bin:/usr/local/bin");
        let parts: Vec<PathBuf> = split_paths(&merged).collect();
        assert_eq!(
            parts,
            vec![
                PathBuf::from("/usr/bin"),
                PathBuf::from("/bin"),
                PathBuf::from("/usr/local/bin"),
            ]
        );
    }

    #[tokio::test]
    async fn test_resolve_rejects_empty() {
        assert!(resolve_executable_path("  ").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_finds_sh() {
        let found = resolve_executable_path("sh").await;
        assert!(found.is_some_and(|p| p.is_file()));
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_from_path() {
        let shell = UnixShell::from_path(Path::new("/bin/sh")).unwrap();
        assert_eq!(shell.get_shell_command().1, "-c");
        assert!(UnixShell::from_path(Path::new("relative/sh")).is_none());
    }
}
