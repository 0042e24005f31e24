//! System browser launcher
//!
//! Uses `$BROWSER` when set, otherwise the platform opener
//! (`open` on macOS, `cmd /C start` on Windows, `xdg-open` elsewhere).
//! The launcher does not wait for the browser; the opener is reaped on a
//! background thread once it exits.

use std::process::{Child, Command, Stdio};

use oauth_client::{Error, Result};
use oauth_session::BrowserLauncher;
use tracing::{debug, info, warn};

pub struct SystemBrowser {
    program_override: Option<String>,
}

impl SystemBrowser {
    /// Launcher honoring `$BROWSER`.
    pub fn from_env() -> Self {
        Self {
            program_override: std::env::var("BROWSER").ok(),
        }
    }

    /// Launcher that always runs `program <url>`.
    #[cfg(test)]
    fn with_program(program: impl Into<String>) -> Self {
        Self {
            program_override: Some(program.into()),
        }
    }
}

impl BrowserLauncher for SystemBrowser {
    fn launch(&self, url: &str) -> Result<()> {
        let (program, args) = command_for(url, self.program_override.clone());
        info!(%url, "opening authorization URL in browser");
        debug!(%program, "browser command");

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::BrowserLaunch(format!("{program}: {e}")))?;
        reap(program, child);
        Ok(())
    }
}

/// Wait for the opener in the background so it does not linger as a zombie.
fn reap(program: String, mut child: Child) {
    let spawned = std::thread::Builder::new()
        .name("browser-reaper".into())
        .spawn(move || match child.wait() {
            Ok(status) => debug!(%program, %status, "browser command exited"),
            Err(e) => warn!(%program, error = %e, "failed to wait for browser command"),
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to start browser reaper thread");
    }
}

/// Program and arguments that open `url`.
fn command_for(url: &str, browser_override: Option<String>) -> (String, Vec<String>) {
    if let Some(browser) = browser_override.filter(|b| !b.trim().is_empty()) {
        return (browser, vec![url.to_string()]);
    }

    if cfg!(target_os = "macos") {
        ("open".into(), vec![url.into()])
    } else if cfg!(target_os = "windows") {
        // Empty title argument so `start` does not treat the URL as one
        (
            "cmd".into(),
            vec!["/C".into(), "start".into(), String::new(), url.into()],
        )
    } else {
        ("xdg-open".into(), vec![url.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_override_wins() {
        let (program, args) = command_for("https://auth.example/a", Some("firefox".into()));
        assert_eq!(program, "firefox");
        assert_eq!(args, vec!["https://auth.example/a"]);
    }

    #[test]
    fn blank_override_falls_back_to_platform_opener() {
        let (program, args) = command_for("https://auth.example/a", Some("  ".into()));
        assert_ne!(program, "  ");
        assert_eq!(args.last().map(String::as_str), Some("https://auth.example/a"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_uses_xdg_open() {
        let (program, _) = command_for("https://auth.example/a", None);
        assert_eq!(program, "xdg-open");
    }

    #[test]
    fn missing_browser_program_fails_launch() {
        let browser = SystemBrowser::with_program("/nonexistent/browser-binary");
        let err = browser.launch("https://auth.example/a").unwrap_err();
        assert!(
            matches!(err, Error::BrowserLaunch(ref m) if m.contains("browser-binary")),
            "got: {err:?}"
        );
    }

    #[cfg(unix)]
    #[test]
    fn launch_runs_browser_program() {
        let browser = SystemBrowser::with_program("true");
        browser.launch("https://auth.example/a").unwrap();
    }
}
