//! Configuration for launching and tuning the browser connection.

use crate::detect::detect_chrome_executable;
use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
};

/// Configuration for the Chromium transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Chrome/Chromium executable. Empty when nothing was detected.
    pub executable: PathBuf,
    pub user_data_dir: PathBuf,
    pub headless: bool,
    /// Deadline applied to every CDP command round-trip.
    pub command_deadline_ms: u64,
    /// Keep-alive interval for the transport; 0 disables the heartbeat.
    pub heartbeat_interval_ms: u64,
    /// Attach to an already-running browser instead of launching one.
    pub websocket_url: Option<String>,
    /// JPEG quality used for observation screenshots (1-100).
    pub screenshot_quality: u8,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: detect_chrome_executable().unwrap_or_default(),
            user_data_dir: default_profile_dir(),
            headless: resolve_headless_default(),
            command_deadline_ms: 30_000,
            heartbeat_interval_ms: 15_000,
            websocket_url: None,
            screenshot_quality: 70,
        }
    }
}

impl BrowserConfig {
    pub fn with_websocket_url(mut self, url: impl Into<String>) -> Self {
        self.websocket_url = Some(url.into());
        self
    }

    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = path.into();
        self
    }

    pub fn headless(mut self, flag: bool) -> Self {
        self.headless = flag;
        self
    }
}

fn resolve_headless_default() -> bool {
    // AUTOSURF_HEADLESS: "0", "false", "no", "off" means headful.
    match env::var("AUTOSURF_HEADLESS") {
        Ok(value) => {
            let lower = value.to_ascii_lowercase();
            !matches!(lower.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => true,
    }
}

fn default_profile_dir() -> PathBuf {
    if let Ok(path) = env::var("AUTOSURF_PROFILE") {
        return PathBuf::from(path);
    }
    Path::new("./.autosurf-profile").into()
}
