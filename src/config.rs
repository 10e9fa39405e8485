use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Number of grid cells. Cell 1 is the live feed; cells 2..10 are
/// recordable. The layout is fixed at runtime.
pub const GRID_CELLS: usize = 10;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub camera: CameraSection,
    pub grid: GridSection,
    pub recording: RecordingSection,
    pub output: OutputSection,
    pub timeouts: TimeoutSection,
}

/// Camera source configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraSection {
    /// Capture backend. "synthetic" is the deterministic colour-ramp
    /// source; device backends plug in behind the same trait.
    #[serde(default = "default_source")]
    pub source: String,

    /// Live-path queue depth in frames (leaky downstream).
    #[serde(default = "default_live_queue_frames")]
    pub live_queue_frames: usize,
}

/// Grid geometry
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct GridSection {
    /// Width of one cell in the composited strip, pixels.
    #[serde(default = "default_cell_width")]
    pub cell_width: u32,
}

/// Per-cell recording configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RecordingSection {
    /// Ring buffer capacity in frames (~2 s at 30 fps).
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Budget for retained frame memory across all ring buffers, bytes.
    #[serde(default = "default_memory_budget")]
    pub memory_budget_bytes: u64,
}

/// Render cadence and monitoring
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputSection {
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,

    /// Tolerance around the target for the Valid verdict.
    #[serde(default = "default_fps_tolerance")]
    pub fps_tolerance: f64,

    /// Rolling window of rendered-frame timestamps kept by the monitor.
    #[serde(default = "default_monitor_window")]
    pub monitor_window: usize,
}

/// Blocking limits and polling cadences
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TimeoutSection {
    /// Permission prompt wait; expiry is treated as denied.
    #[serde(default = "default_permission_secs")]
    pub permission_secs: u64,

    /// Pipeline state change budget; exceeding it is a deadlock.
    #[serde(default = "default_state_change_ms")]
    pub state_change_ms: u64,

    /// Deadlock watchdog polling granularity.
    #[serde(default = "default_watchdog_poll_ms")]
    pub watchdog_poll_ms: u64,

    /// Camera health probe interval.
    #[serde(default = "default_camera_poll_ms")]
    pub camera_poll_ms: u64,

    /// Reinitialisation attempts after a camera disconnect.
    #[serde(default = "default_disconnect_retries")]
    pub disconnect_retries: u32,

    /// Backoff between reinitialisation attempts.
    #[serde(default = "default_disconnect_backoff_ms")]
    pub disconnect_backoff_ms: u64,
}

// Default value functions
fn default_source() -> String { "synthetic".to_string() }
fn default_live_queue_frames() -> usize { 6 }
fn default_cell_width() -> u32 { 320 }
fn default_capacity() -> usize { 60 }
fn default_memory_budget() -> u64 { 3_650_722_201 } // ~3.4 GB
fn default_target_fps() -> u32 { 120 }
fn default_fps_tolerance() -> f64 { 2.0 }
fn default_monitor_window() -> usize { 300 }
fn default_permission_secs() -> u64 { 30 }
fn default_state_change_ms() -> u64 { 10_000 }
fn default_watchdog_poll_ms() -> u64 { 100 }
fn default_camera_poll_ms() -> u64 { 500 }
fn default_disconnect_retries() -> u32 { 5 }
fn default_disconnect_backoff_ms() -> u64 { 250 }

impl Default for CameraSection {
    fn default() -> Self {
        CameraSection {
            source: default_source(),
            live_queue_frames: default_live_queue_frames(),
        }
    }
}

impl Default for GridSection {
    fn default() -> Self {
        GridSection {
            cell_width: default_cell_width(),
        }
    }
}

impl Default for RecordingSection {
    fn default() -> Self {
        RecordingSection {
            capacity: default_capacity(),
            memory_budget_bytes: default_memory_budget(),
        }
    }
}

impl Default for OutputSection {
    fn default() -> Self {
        OutputSection {
            target_fps: default_target_fps(),
            fps_tolerance: default_fps_tolerance(),
            monitor_window: default_monitor_window(),
        }
    }
}

impl Default for TimeoutSection {
    fn default() -> Self {
        TimeoutSection {
            permission_secs: default_permission_secs(),
            state_change_ms: default_state_change_ms(),
            watchdog_poll_ms: default_watchdog_poll_ms(),
            camera_poll_ms: default_camera_poll_ms(),
            disconnect_retries: default_disconnect_retries(),
            disconnect_backoff_ms: default_disconnect_backoff_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.recording.capacity > 0, "recording.capacity must be > 0");
        anyhow::ensure!(self.output.target_fps > 0, "output.target-fps must be > 0");
        anyhow::ensure!(
            self.output.monitor_window >= 2,
            "output.monitor-window must hold at least two samples"
        );
        anyhow::ensure!(self.grid.cell_width > 0, "grid.cell-width must be > 0");
        anyhow::ensure!(
            self.camera.live_queue_frames > 0,
            "camera.live-queue-frames must be > 0"
        );
        Ok(())
    }

    pub fn state_change_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.state_change_ms)
    }

    pub fn watchdog_poll(&self) -> Duration {
        Duration::from_millis(self.timeouts.watchdog_poll_ms)
    }

    pub fn camera_poll(&self) -> Duration {
        Duration::from_millis(self.timeouts.camera_poll_ms)
    }

    pub fn permission_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.permission_secs)
    }

    pub fn disconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.timeouts.disconnect_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.recording.capacity, 60);
        assert_eq!(config.output.target_fps, 120);
        assert_eq!(config.timeouts.state_change_ms, 10_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[recording]\ncapacity = 10\n\n[output]\ntarget-fps = 60\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.recording.capacity, 10);
        assert_eq!(config.output.target_fps, 60);
        // Untouched sections keep their defaults.
        assert_eq!(config.camera.source, "synthetic");
        assert_eq!(config.timeouts.disconnect_retries, 5);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[recording]\ncapacity = 0\n").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }
}
