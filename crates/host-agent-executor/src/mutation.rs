//! Mutation executors and the language registry.
//!
//! Each executor wraps operator-configured [`CommandTemplate`]s and runs
//! them through the shared [`CommandExecutor`], so mutation hooks get the
//! same deadline and process-group handling as ordinary commands.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use host_agent_core::{
    MutationExecutor,
    ids::sanitize_component,
    traits::{MutationError, MutationRequest, MutationTechnique},
};
use tempfile::TempDir;

use crate::{
    command::CommandTemplate,
    runner::{CommandExecution, CommandExecutor, ExecutionState},
};

/// Default file name the payload is written to before compiling.
pub const DEFAULT_SOURCE_FILE: &str = "payload.src";
/// Default file name the compile step must produce.
pub const DEFAULT_ARTIFACT_FILE: &str = "payload.out";

const PATCH_FILE: &str = "payload.patch";

/// Compile the payload, then load the resulting artifact.
///
/// The compile template sees `{source}`, `{output}`, `{workdir}`,
/// `{target}` and `{method}`. The load template sees `{output}`,
/// `{target}` and `{method}`. Without a load template the artifact is
/// staged under `<modules_root>/<target>/<method>/`.
pub struct CompileLoadExecutor {
    runner: CommandExecutor,
    work_root: PathBuf,
    modules_root: PathBuf,
    compile: CommandTemplate,
    load: Option<CommandTemplate>,
    source_file: String,
    artifact_file: String,
    timeout: Duration,
}

impl CompileLoadExecutor {
    /// Create an executor staging work under `data_dir`.
    #[must_use]
    pub fn new(
        runner: CommandExecutor,
        data_dir: &Path,
        compile: CommandTemplate,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            work_root: data_dir.join("work"),
            modules_root: data_dir.join("modules"),
            compile,
            load: None,
            source_file: DEFAULT_SOURCE_FILE.to_string(),
            artifact_file: DEFAULT_ARTIFACT_FILE.to_string(),
            timeout,
        }
    }

    /// Run `load` after a successful compile instead of staging.
    #[must_use]
    pub fn with_load(mut self, load: CommandTemplate) -> Self {
        self.load = Some(load);
        self
    }

    /// Override the source and artifact file names.
    #[must_use]
    pub fn with_file_names(mut self, source: &str, artifact: &str) -> Self {
        self.source_file = sanitize_component(source);
        self.artifact_file = sanitize_component(artifact);
        self
    }

    async fn stage(
        &self,
        artifact: &Path,
        request: &MutationRequest,
    ) -> Result<PathBuf, MutationError> {
        let dir = self
            .modules_root
            .join(sanitize_component(&request.target))
            .join(sanitize_component(&request.method));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| MutationError::LoadError(format!("cannot create {}: {e}", dir.display())))?;
        let dest = dir.join(&self.artifact_file);
        if tokio::fs::rename(artifact, &dest).await.is_err() {
            // rename fails across filesystems
            copy_atomically(artifact.to_path_buf(), dest.clone())
                .await
                .map_err(|e| MutationError::LoadError(format!("cannot stage artifact: {e}")))?;
        }
        Ok(dest)
    }
}

#[async_trait]
impl MutationExecutor for CompileLoadExecutor {
    fn technique(&self) -> MutationTechnique {
        MutationTechnique::CompileAndLoad
    }

    async fn apply(&self, request: &MutationRequest) -> Result<(), MutationError> {
        let work = work_dir(&self.work_root)
            .await
            .map_err(MutationError::CompileError)?;
        let source = work.path().join(&self.source_file);
        let output = work.path().join(&self.artifact_file);
        tokio::fs::write(&source, request.payload.as_bytes())
            .await
            .map_err(|e| MutationError::CompileError(format!("cannot write source: {e}")))?;

        let source_str = source.to_string_lossy().into_owned();
        let output_str = output.to_string_lossy().into_owned();
        let workdir_str = work.path().to_string_lossy().into_owned();
        let parts = self
            .compile
            .render(&[
                ("source", source_str.as_str()),
                ("output", output_str.as_str()),
                ("workdir", workdir_str.as_str()),
                ("target", request.target.as_str()),
                ("method", request.method.as_str()),
            ])
            .map_err(|e| MutationError::CompileError(e.to_string()))?;

        let execution = self.runner.run_parts(parts, self.timeout).await;
        check(&execution).map_err(MutationError::CompileError)?;
        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(MutationError::CompileError(
                "compiler produced no artifact".to_string(),
            ));
        }
        tracing::debug!(target_name = %request.target, method = %request.method, "payload compiled");

        if let Some(load) = &self.load {
            let parts = load
                .render(&[
                    ("output", output_str.as_str()),
                    ("target", request.target.as_str()),
                    ("method", request.method.as_str()),
                ])
                .map_err(|e| MutationError::LoadError(e.to_string()))?;
            let execution = self.runner.run_parts(parts, self.timeout).await;
            check(&execution).map_err(MutationError::LoadError)?;
        } else {
            let dest = self.stage(&output, request).await?;
            tracing::info!(artifact = %dest.display(), "artifact staged");
        }
        Ok(())
    }
}

/// Apply a base64-encoded binary patch through a patch command.
///
/// The template sees `{patch}`, `{target}` and `{method}`.
pub struct BytePatchExecutor {
    runner: CommandExecutor,
    work_root: PathBuf,
    patch: CommandTemplate,
    timeout: Duration,
}

impl BytePatchExecutor {
    /// Create an executor staging patch files under `data_dir`.
    #[must_use]
    pub fn new(
        runner: CommandExecutor,
        data_dir: &Path,
        patch: CommandTemplate,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            work_root: data_dir.join("work"),
            patch,
            timeout,
        }
    }
}

#[async_trait]
impl MutationExecutor for BytePatchExecutor {
    fn technique(&self) -> MutationTechnique {
        MutationTechnique::BytePatch
    }

    async fn apply(&self, request: &MutationRequest) -> Result<(), MutationError> {
        let compact: String = request
            .payload
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let bytes = STANDARD
            .decode(compact)
            .map_err(|e| MutationError::LoadError(format!("payload is not valid base64: {e}")))?;
        if bytes.is_empty() {
            return Err(MutationError::LoadError("patch is empty".to_string()));
        }

        let work = work_dir(&self.work_root)
            .await
            .map_err(MutationError::LoadError)?;
        let patch_path = work.path().join(PATCH_FILE);
        tokio::fs::write(&patch_path, &bytes)
            .await
            .map_err(|e| MutationError::LoadError(format!("cannot write patch: {e}")))?;

        let patch_str = patch_path.to_string_lossy().into_owned();
        let parts = self
            .patch
            .render(&[
                ("patch", patch_str.as_str()),
                ("target", request.target.as_str()),
                ("method", request.method.as_str()),
            ])
            .map_err(|e| MutationError::LoadError(e.to_string()))?;
        let execution = self.runner.run_parts(parts, self.timeout).await;
        check(&execution).map_err(MutationError::LoadError)?;
        tracing::debug!(target_name = %request.target, bytes = bytes.len(), "patch applied");
        Ok(())
    }
}

/// Executors keyed by payload language tag.
#[derive(Clone, Default)]
pub struct MutationExecutors {
    by_language: HashMap<String, Arc<dyn MutationExecutor>>,
}

impl MutationExecutors {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for `language`, replacing any previous one.
    pub fn register(&mut self, language: impl Into<String>, executor: Arc<dyn MutationExecutor>) {
        self.by_language
            .insert(language.into().to_ascii_lowercase(), executor);
    }

    /// Look up the executor for a language tag.
    ///
    /// # Errors
    /// Returns `UnsupportedKind` if no executor handles `language`.
    pub fn get(&self, language: &str) -> Result<Arc<dyn MutationExecutor>, MutationError> {
        self.by_language
            .get(&language.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| MutationError::UnsupportedKind(language.to_string()))
    }

    /// Registered language tags, sorted.
    #[must_use]
    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<_> = self.by_language.keys().cloned().collect();
        languages.sort();
        languages
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_language.is_empty()
    }
}

async fn work_dir(root: &Path) -> Result<TempDir, String> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| format!("cannot create {}: {e}", root.display()))?;
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || tempfile::Builder::new().prefix("mutation-").tempdir_in(root))
        .await
        .map_err(|e| format!("work directory task failed: {e}"))?
        .map_err(|e| format!("cannot create work directory: {e}"))
}

/// Copy `src` over `dest` through a temp file in `dest`'s directory, so
/// readers see either the old file or the complete new one.
async fn copy_atomically(src: PathBuf, dest: PathBuf) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        std::io::copy(&mut std::fs::File::open(&src)?, staged.as_file_mut())?;
        staged.as_file().sync_all()?;
        staged.persist(&dest).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Map a finished execution to the text describing why it failed.
fn check(execution: &CommandExecution) -> Result<(), String> {
    match execution.state {
        ExecutionState::Completed if execution.exit_code == Some(0) => Ok(()),
        ExecutionState::Completed => {
            let stderr = execution.stderr.trim();
            if stderr.is_empty() {
                Err(format!(
                    "exited with code {}",
                    execution.exit_code.unwrap_or_default()
                ))
            } else {
                Err(stderr.to_string())
            }
        }
        _ => Err(execution
            .outcome()
            .err()
            .map_or_else(|| "command did not complete".to_string(), |e| e.to_string())),
    }
}
