//! Stream inspection and orientation classification.
//!
//! The probe itself is an external tool behind [`ProbeTool`]; the inspector
//! only looks at the first reported stream and classifies its aspect ratio.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

const LANDSCAPE_RATIO: f64 = 16.0 / 9.0;
const PORTRAIT_RATIO: f64 = 9.0 / 16.0;

/// Errors from inspecting a staged video
#[derive(Debug, Error)]
pub enum InspectionError {
    #[error("Probe tool failed: {0}")]
    ToolFailed(String),

    #[error("Unable to decode probe output: {0}")]
    Decode(String),

    #[error("No streams found for video")]
    NoStreams,

    #[error("Invalid stream geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },
}

/// Coarse display orientation of a video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Orientation {
    Landscape,
    Portrait,
    Other,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Landscape => "landscape",
            Orientation::Portrait => "portrait",
            Orientation::Other => "other",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stream as reported by the probe tool. Streams without a picture
/// (audio, data) report zero dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct StreamGeometry {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// Structured probe output
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeReport {
    #[serde(default)]
    pub streams: Vec<StreamGeometry>,
}

impl ProbeReport {
    /// Parse ffprobe's `-print_format json -show_streams` output.
    pub fn from_json(bytes: &[u8]) -> Result<Self, InspectionError> {
        serde_json::from_slice(bytes).map_err(|e| InspectionError::Decode(e.to_string()))
    }
}

/// External stream-probing tool
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProbeTool: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeReport, InspectionError>;
}

/// `ffprobe` launched as a subprocess
pub struct FfprobeTool {
    program: String,
}

impl FfprobeTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ProbeTool for FfprobeTool {
    #[instrument(skip(self), fields(process.executable.name = "ffprobe", process.executable.path = %self.program))]
    async fn probe(&self, path: &Path) -> Result<ProbeReport, InspectionError> {
        let output = Command::new(&self.program)
            .args(["-v", "error", "-print_format", "json", "-show_streams"])
            .arg(path)
            .output()
            .await
            .map_err(|e| InspectionError::ToolFailed(format!("failed to launch {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(InspectionError::ToolFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        ProbeReport::from_json(&output.stdout)
    }
}

/// Classify a known geometry.
///
/// Within `tolerance` (strict `<`) of 16:9 is landscape, of 9:16 portrait,
/// anything else is other. Zero width or height is an error.
pub fn classify(geometry: StreamGeometry, tolerance: f64) -> Result<Orientation, InspectionError> {
    let StreamGeometry { width, height } = geometry;
    if width == 0 || height == 0 {
        return Err(InspectionError::InvalidGeometry { width, height });
    }

    let ratio = f64::from(width) / f64::from(height);
    let orientation = if (ratio - LANDSCAPE_RATIO).abs() < tolerance {
        Orientation::Landscape
    } else if (ratio - PORTRAIT_RATIO).abs() < tolerance {
        Orientation::Portrait
    } else {
        Orientation::Other
    };

    Ok(orientation)
}

/// Runs a single probe per upload and classifies the first stream
pub struct MediaInspector<P: ?Sized> {
    tool: std::sync::Arc<P>,
    tolerance: f64,
}

impl<P: ProbeTool + ?Sized> MediaInspector<P> {
    pub fn new(tool: std::sync::Arc<P>, tolerance: f64) -> Self {
        Self { tool, tolerance }
    }

    /// Inspect a staged file. Only the first stream counts, whatever its kind.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn inspect(&self, path: &Path) -> Result<Orientation, InspectionError> {
        let start = Instant::now();

        let report = self.tool.probe(path).await?;
        let first = report.streams.first().copied().ok_or(InspectionError::NoStreams)?;
        let orientation = classify(first, self.tolerance)?;

        let elapsed = start.elapsed();
        metrics::histogram!("video.inspect.duration_seconds").record(elapsed.as_secs_f64());
        debug!(
            width = first.width,
            height = first.height,
            stream_count = report.streams.len(),
            orientation = %orientation,
            duration_ms = elapsed.as_millis() as u64,
            "Video inspected"
        );

        Ok(orientation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn geometry(width: u32, height: u32) -> StreamGeometry {
        StreamGeometry { width, height }
    }

    fn inspector_with(report: Result<ProbeReport, InspectionError>) -> MediaInspector<MockProbeTool> {
        let mut tool = MockProbeTool::new();
        let mut report = Some(report);
        tool.expect_probe()
            .times(1)
            .returning(move |_| report.take().expect("probe called once"));
        MediaInspector::new(Arc::new(tool), 0.02)
    }

    #[test]
    fn test_classify_common_resolutions() {
        assert_eq!(classify(geometry(1920, 1080), 0.02).unwrap(), Orientation::Landscape);
        assert_eq!(classify(geometry(1280, 720), 0.02).unwrap(), Orientation::Landscape);
        assert_eq!(classify(geometry(1080, 1920), 0.02).unwrap(), Orientation::Portrait);
        assert_eq!(classify(geometry(720, 1280), 0.02).unwrap(), Orientation::Portrait);
        assert_eq!(classify(geometry(1000, 1000), 0.02).unwrap(), Orientation::Other);
        assert_eq!(classify(geometry(640, 480), 0.02).unwrap(), Orientation::Other);
    }

    #[test]
    fn test_classify_near_ratio() {
        // 1900/1080 = 1.7593, 0.0185 below 16:9
        assert_eq!(classify(geometry(1900, 1080), 0.02).unwrap(), Orientation::Landscape);
        // 1950/1080 = 1.8056, 0.0278 above 16:9
        assert_eq!(classify(geometry(1950, 1080), 0.02).unwrap(), Orientation::Other);
        // 600/1080 = 0.5556, 0.0069 below 9:16
        assert_eq!(classify(geometry(600, 1080), 0.02).unwrap(), Orientation::Portrait);
    }

    #[test]
    fn test_classify_boundary_is_exclusive() {
        // Exactly the tolerance away is not a match.
        let tolerance = 2.0 - LANDSCAPE_RATIO;
        assert_eq!(classify(geometry(2, 1), tolerance).unwrap(), Orientation::Other);
        assert_eq!(
            classify(geometry(2, 1), tolerance + 1e-9).unwrap(),
            Orientation::Landscape
        );
    }

    #[test]
    fn test_classify_zero_dimensions() {
        for (w, h) in [(0, 1080), (1920, 0), (0, 0)] {
            assert!(matches!(
                classify(geometry(w, h), 0.02),
                Err(InspectionError::InvalidGeometry { .. })
            ));
        }
    }

    #[test]
    fn test_probe_report_parsing() {
        let json = br#"{"streams":[{"index":0,"codec_type":"video","width":1920,"height":1080},{"index":1,"codec_type":"audio"}]}"#;
        let report = ProbeReport::from_json(json).unwrap();
        assert_eq!(report.streams, vec![geometry(1920, 1080), geometry(0, 0)]);

        let empty = ProbeReport::from_json(b"{}").unwrap();
        assert!(empty.streams.is_empty());

        assert!(matches!(
            ProbeReport::from_json(b"not json"),
            Err(InspectionError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_inspect_uses_first_stream() {
        let inspector = inspector_with(Ok(ProbeReport {
            streams: vec![geometry(1080, 1920), geometry(1920, 1080)],
        }));
        let orientation = inspector.inspect(&PathBuf::from("/tmp/a.mp4")).await.unwrap();
        assert_eq!(orientation, Orientation::Portrait);
    }

    #[tokio::test]
    async fn test_inspect_first_stream_audio_only() {
        let inspector = inspector_with(Ok(ProbeReport {
            streams: vec![geometry(0, 0), geometry(1920, 1080)],
        }));
        let result = inspector.inspect(&PathBuf::from("/tmp/a.mp4")).await;
        assert!(matches!(result, Err(InspectionError::InvalidGeometry { .. })));
    }

    #[tokio::test]
    async fn test_inspect_no_streams() {
        let inspector = inspector_with(Ok(ProbeReport::default()));
        let result = inspector.inspect(&PathBuf::from("/tmp/a.mp4")).await;
        assert!(matches!(result, Err(InspectionError::NoStreams)));
    }

    #[tokio::test]
    async fn test_inspect_tool_failure_passes_through() {
        let inspector = inspector_with(Err(InspectionError::ToolFailed("boom".to_string())));
        let result = inspector.inspect(&PathBuf::from("/tmp/a.mp4")).await;
        assert!(matches!(result, Err(InspectionError::ToolFailed(msg)) if msg == "boom"));
    }

    #[tokio::test]
    async fn test_ffprobe_launch_failure() {
        let tool = FfprobeTool::new("/nonexistent/ffprobe-binary");
        let result = tool.probe(&PathBuf::from("/tmp/a.mp4")).await;
        assert!(matches!(result, Err(InspectionError::ToolFailed(_))));
    }
}
