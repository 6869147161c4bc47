//! Chrome/Chromium executable detection.

use std::env;
use std::path::PathBuf;

use which::which;

#[cfg(target_os = "windows")]
const BINARY_NAMES: &[&str] = &["chrome.exe", "chromium.exe", "msedge.exe"];
#[cfg(not(target_os = "windows"))]
const BINARY_NAMES: &[&str] = &[
    "google-chrome-stable",
    "google-chrome",
    "chromium",
    "chromium-browser",
];

/// Locate a usable Chrome/Chromium executable.
///
/// `AUTOSURF_CHROME` wins when it points at an existing file. Otherwise the
/// platform's usual binary names are tried on PATH, then the common install
/// locations. `AUTOSURF_SKIP_OS_PATHS` suppresses the install-location scan
/// so tests stay hermetic.
pub fn detect_chrome_executable() -> Option<PathBuf> {
    if let Some(path) = env_override() {
        return Some(path);
    }
    if let Some(path) = BINARY_NAMES.iter().find_map(|name| which(name).ok()) {
        return Some(path);
    }
    if skip_install_dirs() {
        return None;
    }
    install_candidates().into_iter().find(|path| path.exists())
}

fn env_override() -> Option<PathBuf> {
    let raw = env::var("AUTOSURF_CHROME").ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = PathBuf::from(trimmed);
    candidate.exists().then_some(candidate)
}

fn skip_install_dirs() -> bool {
    env::var("AUTOSURF_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}

#[cfg(target_os = "windows")]
fn install_candidates() -> Vec<PathBuf> {
    let roots = ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"];
    roots
        .iter()
        .filter_map(|key| env::var(key).ok())
        .filter(|value| !value.trim().is_empty())
        .flat_map(|value| {
            let root = PathBuf::from(value);
            [
                root.join("Google/Chrome/Application/chrome.exe"),
                root.join("Chromium/Application/chrome.exe"),
                root.join("Microsoft/Edge/Application/msedge.exe"),
            ]
        })
        .collect()
}

#[cfg(target_os = "macos")]
fn install_candidates() -> Vec<PathBuf> {
    [
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn install_candidates() -> Vec<PathBuf> {
    [
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::tempdir;

    /// Restores an env var to its prior value when dropped.
    struct EnvVarGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = env::var(key).ok();
            env::set_var(key, value);
            Self { key, prior }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match &self.prior {
                Some(value) => env::set_var(self.key, value),
                None => env::remove_var(self.key),
            }
        }
    }

    #[test]
    #[serial]
    fn env_override_wins() {
        let dir = tempdir().unwrap();
        let exe = dir.path().join("my-chrome");
        fs::write(&exe, b"").unwrap();

        let _chrome = EnvVarGuard::set("AUTOSURF_CHROME", &exe.to_string_lossy());
        assert_eq!(detect_chrome_executable(), Some(exe));
    }

    #[test]
    #[serial]
    fn falls_back_to_path_lookup() {
        let dir = tempdir().unwrap();
        let exe = dir.path().join(BINARY_NAMES[0]);
        fs::write(&exe, b"").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let _chrome = EnvVarGuard::set("AUTOSURF_CHROME", "");
        let _skip = EnvVarGuard::set("AUTOSURF_SKIP_OS_PATHS", "1");
        let _path = EnvVarGuard::set("PATH", &dir.path().to_string_lossy());
        assert_eq!(detect_chrome_executable(), Some(exe));
    }
}
