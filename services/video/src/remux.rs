//! Fast-start remuxing.
//!
//! Rewrites an MP4 so its `moov` index sits before the media data, letting
//! players start before the download completes. Streams are copied, never
//! re-encoded.

use crate::staging::TransientFile;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

/// Suffix appended to the staged file name for the remuxed copy.
const OUTPUT_SUFFIX: &str = ".processing";

#[derive(Debug, Error)]
pub enum RemuxError {
    #[error("Remux tool failed: {0}")]
    ToolFailed(String),

    #[error("Could not stat remuxed file {path}: {source} (tool output: {diagnostics})")]
    MissingOutput {
        path: PathBuf,
        diagnostics: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Remuxed file {path} is empty (tool output: {diagnostics})")]
    EmptyOutput { path: PathBuf, diagnostics: String },
}

/// External remuxing tool
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemuxTool: Send + Sync {
    /// Write a fast-start copy of `input` to `output`, copying all streams.
    /// Returns the tool's diagnostic output.
    async fn remux(&self, input: &Path, output: &Path) -> Result<String, RemuxError>;
}

/// `ffmpeg -c copy -movflags faststart` launched as a subprocess
pub struct FfmpegTool {
    program: String,
}

impl FfmpegTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl RemuxTool for FfmpegTool {
    #[instrument(skip(self), fields(process.executable.name = "ffmpeg", process.executable.path = %self.program))]
    async fn remux(&self, input: &Path, output: &Path) -> Result<String, RemuxError> {
        let result = Command::new(&self.program)
            .arg("-i")
            .arg(input)
            .args(["-c", "copy", "-movflags", "faststart", "-f", "mp4", "-y"])
            .arg(output)
            .output()
            .await
            .map_err(|e| RemuxError::ToolFailed(format!("failed to launch {}: {}", self.program, e)))?;

        let diagnostics = String::from_utf8_lossy(&result.stderr).trim().to_string();
        if !result.status.success() {
            return Err(RemuxError::ToolFailed(format!(
                "{} exited with {}: {}",
                self.program, result.status, diagnostics
            )));
        }

        Ok(diagnostics)
    }
}

/// Path the remuxed copy of `input` is written to.
pub fn output_path_for(input: &Path) -> PathBuf {
    let mut name = OsString::from(input.as_os_str());
    name.push(OUTPUT_SUFFIX);
    PathBuf::from(name)
}

/// Produces playback-optimized copies of staged uploads
pub struct FastStartRemuxer<T: ?Sized> {
    tool: Arc<T>,
}

impl<T: RemuxTool + ?Sized> FastStartRemuxer<T> {
    pub fn new(tool: Arc<T>) -> Self {
        Self { tool }
    }

    /// Remux `input` into a sibling file.
    ///
    /// The returned guard owns the output and deletes it on drop. On failure
    /// any partial output has already been removed.
    #[instrument(skip(self), fields(path = %input.display()))]
    pub async fn remux(&self, input: &Path) -> Result<TransientFile, RemuxError> {
        let start = Instant::now();
        let output = TransientFile::new(output_path_for(input));

        let diagnostics = self.tool.remux(input, output.path()).await?;

        let metadata = match tokio::fs::metadata(output.path()).await {
            Ok(metadata) => metadata,
            Err(source) => {
                return Err(RemuxError::MissingOutput {
                    path: output.path().to_path_buf(),
                    diagnostics,
                    source,
                })
            }
        };
        if metadata.len() == 0 {
            return Err(RemuxError::EmptyOutput {
                path: output.path().to_path_buf(),
                diagnostics,
            });
        }

        let elapsed = start.elapsed();
        metrics::histogram!("video.remux.duration_seconds").record(elapsed.as_secs_f64());
        debug!(
            output = %output.path().display(),
            size_bytes = metadata.len(),
            duration_ms = elapsed.as_millis() as u64,
            "Video remuxed for fast start"
        );

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged_input(dir: &tempfile::TempDir) -> PathBuf {
        let input = dir.path().join("upload.mp4");
        std::fs::write(&input, b"ftyp....mdat....moov").unwrap();
        input
    }

    #[test]
    fn test_output_path_for() {
        assert_eq!(
            output_path_for(Path::new("/tmp/tubely-upload-1.mp4")),
            PathBuf::from("/tmp/tubely-upload-1.mp4.processing")
        );
    }

    #[tokio::test]
    async fn test_remux_success_keeps_output_until_drop() {
        let dir = tempfile::tempdir().unwrap();
        let input = staged_input(&dir);

        let mut tool = MockRemuxTool::new();
        tool.expect_remux().times(1).returning(|_, output| {
            std::fs::write(output, b"moov....mdat").unwrap();
            Ok(String::new())
        });

        let remuxer = FastStartRemuxer::new(Arc::new(tool));
        let output = remuxer.remux(&input).await.unwrap();
        let path = output.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(path, output_path_for(&input));

        drop(output);
        assert!(!path.exists());
        assert!(input.exists());
    }

    #[tokio::test]
    async fn test_remux_empty_output_is_error_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let input = staged_input(&dir);

        let mut tool = MockRemuxTool::new();
        tool.expect_remux().times(1).returning(|_, output| {
            std::fs::write(output, b"").unwrap();
            Ok("moov atom not found".to_string())
        });

        let remuxer = FastStartRemuxer::new(Arc::new(tool));
        let err = remuxer.remux(&input).await.unwrap_err();
        assert!(matches!(
            &err,
            RemuxError::EmptyOutput { diagnostics, .. } if diagnostics == "moov atom not found"
        ));
        assert!(err.to_string().contains("moov atom not found"));
        assert!(!output_path_for(&input).exists());
    }

    #[tokio::test]
    async fn test_remux_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = staged_input(&dir);

        let mut tool = MockRemuxTool::new();
        tool.expect_remux()
            .times(1)
            .returning(|_, _| Ok("Output file is empty, nothing was encoded".to_string()));

        let remuxer = FastStartRemuxer::new(Arc::new(tool));
        let err = remuxer.remux(&input).await.unwrap_err();
        assert!(matches!(
            &err,
            RemuxError::MissingOutput { diagnostics, .. } if diagnostics.contains("nothing was encoded")
        ));
    }

    #[tokio::test]
    async fn test_remux_tool_failure_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = staged_input(&dir);

        let mut tool = MockRemuxTool::new();
        tool.expect_remux().times(1).returning(|_, output| {
            std::fs::write(output, b"partial").unwrap();
            Err(RemuxError::ToolFailed("moov atom not found".to_string()))
        });

        let remuxer = FastStartRemuxer::new(Arc::new(tool));
        let result = remuxer.remux(&input).await;
        assert!(matches!(result, Err(RemuxError::ToolFailed(msg)) if msg.contains("moov")));
        assert!(!output_path_for(&input).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ffmpeg_empty_output_carries_stderr() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let input = staged_input(&dir);

        // Exits 0 but leaves an empty file at its last argument
        let script = dir.path().join("fake-ffmpeg");
        std::fs::write(
            &script,
            "#!/bin/sh\nfor last; do :; done\necho 'moov atom not found' >&2\n: > \"$last\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tool: Arc<dyn RemuxTool> = Arc::new(FfmpegTool::new(script.to_string_lossy()));
        let err = FastStartRemuxer::new(tool).remux(&input).await.unwrap_err();

        assert!(matches!(
            &err,
            RemuxError::EmptyOutput { diagnostics, .. } if diagnostics.contains("moov atom not found")
        ));
        assert!(!output_path_for(&input).exists());
    }

    #[tokio::test]
    async fn test_ffmpeg_launch_failure() {
        let tool = FfmpegTool::new("/nonexistent/ffmpeg-binary");
        let result = tool
            .remux(Path::new("/tmp/in.mp4"), Path::new("/tmp/out.mp4"))
            .await;
        assert!(matches!(result, Err(RemuxError::ToolFailed(_))));
    }
}
