//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP/WebSocket listen address
    pub listen: String,

    /// Grace period for child-process termination, seconds
    pub stop_grace_secs: u64,

    /// A session still `initializing` after this many seconds marks the
    /// health probe degraded
    pub init_stuck_secs: u64,

    /// Virtual display configuration
    pub display: DisplayConfig,

    /// Remote-display (VNC) server configuration
    pub vnc: VncConfig,

    /// Browser engine configuration
    pub browser: BrowserConfig,

    /// Frame stream configuration
    pub stream: StreamConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8003".to_string(),
            stop_grace_secs: 5,
            init_stuck_secs: 60,
            display: DisplayConfig::default(),
            vnc: VncConfig::default(),
            browser: BrowserConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

/// Xvfb-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Xvfb binary name or path
    pub xvfb_binary: String,

    /// First X display number to hand out
    pub display_base: u32,

    /// Settle delay after spawning before the display is considered usable,
    /// milliseconds (Xvfb emits no readiness signal)
    pub settle_ms: u64,

    /// Framebuffer color depth
    pub color_depth: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            xvfb_binary: "Xvfb".to_string(),
            display_base: 100,
            settle_ms: 1000,
            color_depth: 24,
        }
    }
}

/// x11vnc-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VncConfig {
    /// x11vnc binary name or path
    pub x11vnc_binary: String,

    /// First TCP port to probe for VNC servers
    pub port_start: u16,

    /// Bounded scan window for port probing
    pub scan_attempts: u16,

    /// Settle delay after spawning, milliseconds
    pub settle_ms: u64,
}

impl Default for VncConfig {
    fn default() -> Self {
        Self {
            x11vnc_binary: "x11vnc".to_string(),
            port_start: 5900,
            scan_attempts: 100,
            settle_ms: 1000,
        }
    }
}

/// Browser engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Path to the Chromium binary
    pub binary_path: Option<String>,

    /// First TCP port to probe for DevTools endpoints
    pub devtools_port_start: u16,

    /// Run without a virtual display
    pub headless: bool,

    /// Deadline for the DevTools endpoint to answer after spawn, seconds
    pub connect_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            binary_path: None, // resolved to "chromium" at spawn time
            devtools_port_start: 9300,
            headless: false,
            connect_timeout_secs: 30,
        }
    }
}

/// Screencast stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Frame dimension bounds passed to the capture source
    pub max_width: u32,
    pub max_height: u32,

    /// JPEG quality, 0-100
    pub quality: u32,

    /// Capture every Nth compositor frame (2 gives ~30fps)
    pub every_nth_frame: u32,

    /// Per-subscriber delivery timeout, milliseconds; a subscriber that
    /// cannot accept a frame within this window is dropped
    pub send_timeout_ms: u64,

    /// Per-subscriber channel capacity before the send timeout applies
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1080,
            quality: 70,
            every_nth_frame: 2,
            send_timeout_ms: 250,
            channel_capacity: 8,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> browsercast_common::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| browsercast_common::Error::InvalidConfig(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> browsercast_common::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| browsercast_common::Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert_eq!(config.display.display_base, 100);
        assert_eq!(config.vnc.port_start, 5900);
        assert_eq!(config.vnc.scan_attempts, 100);
        assert_eq!(config.stop_grace_secs, 5);
        assert_eq!(config.stream.every_nth_frame, 2);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.listen, DaemonConfig::default().listen);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = DaemonConfig::default();
        config.listen = "0.0.0.0:9000".to_string();
        config.stream.quality = 50;
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.listen, "0.0.0.0:9000");
        assert_eq!(loaded.stream.quality, 50);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "listen = \"127.0.0.1:9999\"\n").unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9999");
        assert_eq!(config.vnc.port_start, 5900);
    }
}
