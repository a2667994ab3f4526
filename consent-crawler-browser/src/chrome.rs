use crate::browser::{Browser, BrowserLauncher};
use crate::error::{BrowserError, Result};
use crate::result::CookieRecord;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::Cookie;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Signal, System};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Launch parameters for Chrome/Chromium.
#[derive(Debug, Clone, Serialize)]
pub struct ChromeOptions {
    /// Browser binary; `None` lets chromiumoxide locate one.
    pub executable: Option<PathBuf>,
    pub headless: bool,
    /// Primed profile copied into every crawl browser.
    pub profile_template: Option<PathBuf>,
    /// Parent directory of the per-site profile copies. A temporary directory
    /// is used when unset.
    pub run_root: Option<PathBuf>,
    /// Upper bound for a single DevTools request.
    pub request_timeout: Duration,
    pub no_sandbox: bool,
    pub window_size: (u32, u32),
}

impl Default for ChromeOptions {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            profile_template: None,
            run_root: None,
            request_timeout: Duration::from_secs(30),
            no_sandbox: true,
            window_size: (1920, 1080),
        }
    }
}

impl ChromeOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(exe) = &self.executable
            && !exe.exists()
        {
            return Err(BrowserError::InvalidOptions(format!(
                "browser executable not found: {}",
                exe.display()
            )));
        }
        if let Some(template) = &self.profile_template
            && template.exists()
            && !template.is_dir()
        {
            return Err(BrowserError::InvalidOptions(format!(
                "profile path is not a directory: {}",
                template.display()
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(BrowserError::InvalidOptions(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn config(&self, user_data_dir: &Path, headless: bool) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .user_data_dir(user_data_dir)
            .request_timeout(self.request_timeout)
            .window_size(self.window_size.0, self.window_size.1)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-dev-shm-usage");

        if !headless {
            builder = builder.with_head();
        }
        if self.no_sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(exe) = &self.executable {
            builder = builder.chrome_executable(exe);
        }

        builder.build().map_err(BrowserError::Launch)
    }
}

/// Launches one isolated Chrome per Site.
///
/// Every crawl browser gets its own copy of the profile template under the
/// run root, so cookies never carry over between Sites.
pub struct ChromeLauncher {
    options: ChromeOptions,
    run_root: PathBuf,
    _temp_root: Option<TempDir>,
}

impl ChromeLauncher {
    pub fn new(options: ChromeOptions) -> Result<Self> {
        options.validate()?;

        let (run_root, temp_root) = match &options.run_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                (root.clone(), None)
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("consent-crawler-")
                    .tempdir()?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };

        Ok(Self {
            options,
            run_root,
            _temp_root: temp_root,
        })
    }

    /// Directory holding every per-site profile of this run.
    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    pub fn options(&self) -> &ChromeOptions {
        &self.options
    }

    fn prepare_profile(&self, worker_id: usize) -> Result<PathBuf> {
        let dir = self
            .run_root
            .join(format!("w{}-{}", worker_id, uuid::Uuid::new_v4().simple()));

        match &self.options.profile_template {
            Some(template) if template.is_dir() => copy_dir_all(template, &dir)?,
            _ => std::fs::create_dir_all(&dir)?,
        }
        Ok(dir)
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, worker_id: usize) -> Result<Box<dyn Browser>> {
        let profile_dir = self.prepare_profile(worker_id)?;
        let config = self.options.config(&profile_dir, self.options.headless)?;

        debug!(worker_id, "Launching browser on {}", profile_dir.display());
        match ChromeBrowser::start(config, Some(profile_dir.clone())).await {
            Ok(browser) => Ok(Box::new(browser)),
            Err(e) => {
                terminate_marked(profile_dir.clone()).await;
                remove_profile(&profile_dir);
                Err(e)
            }
        }
    }

    async fn launch_interactive(&self) -> Result<Box<dyn Browser>> {
        let profile = self.options.profile_template.clone().ok_or_else(|| {
            BrowserError::InvalidOptions("no profile directory to prime".to_string())
        })?;
        std::fs::create_dir_all(&profile)?;

        info!("Launching interactive browser on {}", profile.display());
        let config = self.options.config(&profile, false)?;
        let browser = ChromeBrowser::start(config, None).await?;
        Ok(Box::new(browser))
    }
}

/// One Chrome process driven over the DevTools protocol.
pub struct ChromeBrowser {
    browser: CdpBrowser,
    page: Page,
    handler: JoinHandle<()>,
    /// Disposable profile; `None` for the persistent priming profile.
    profile_dir: Option<PathBuf>,
    killed: bool,
}

impl ChromeBrowser {
    async fn start(config: BrowserConfig, profile_dir: Option<PathBuf>) -> Result<Self> {
        let (mut browser, mut handler) = CdpBrowser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("DevTools handler: {}", e);
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.kill().await;
                handler.abort();
                return Err(BrowserError::Launch(e.to_string()));
            }
        };

        Ok(Self {
            browser,
            page,
            handler,
            profile_dir,
            killed: false,
        })
    }
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Err(_) => Err(BrowserError::NavigationTimeout {
                url: url.to_string(),
                after: timeout,
            }),
            Ok(Err(CdpError::Timeout)) => Err(BrowserError::NavigationTimeout {
                url: url.to_string(),
                after: timeout,
            }),
            Ok(Err(e)) => Err(classify(e, BrowserError::Navigation)),
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn evaluate(&mut self, script: &str) -> Result<Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| classify(e, BrowserError::Script))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    /// Every cookie of the browser context, third-party ones included.
    async fn read_cookies(&mut self) -> Result<Vec<CookieRecord>> {
        let cookies = self
            .browser
            .get_cookies()
            .await
            .map_err(|e| classify(e, BrowserError::Script))?;
        Ok(cookies.iter().map(to_record).collect())
    }

    async fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;

        if let Some(Err(e)) = self.browser.kill().await {
            warn!("Failed to kill browser: {}", e);
        }
        self.handler.abort();

        if let Some(dir) = self.profile_dir.take() {
            terminate_marked(dir.clone()).await;
            remove_profile(&dir);
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }
        if let Err(e) = self.browser.close().await {
            debug!("Graceful close failed: {}", e);
        } else if let Err(e) = self.browser.wait().await {
            debug!("Waiting for browser exit failed: {}", e);
        }
        self.kill().await;
        Ok(())
    }
}

fn classify(err: CdpError, otherwise: fn(String) -> BrowserError) -> BrowserError {
    match err {
        CdpError::Ws(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse => {
            BrowserError::Crashed(err.to_string())
        }
        other => otherwise(other.to_string()),
    }
}

fn to_record(cookie: &Cookie) -> CookieRecord {
    let mut record = CookieRecord::new(&cookie.name, &cookie.value, &cookie.domain);
    record.path = cookie.path.clone();
    record.session = cookie.session;
    record.expiry = if cookie.session || cookie.expires < 0.0 {
        None
    } else {
        Some(cookie.expires)
    };
    record.http_only = cookie.http_only;
    record.secure = cookie.secure;
    record.same_site = cookie.same_site.as_ref().map(|s| format!("{:?}", s));
    record
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
        // Chrome's Singleton* lock symlinks are left behind.
    }
    Ok(())
}

fn remove_profile(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Could not remove profile {}: {}", dir.display(), e);
    }
}

/// Kill every process whose command line mentions `marker`.
///
/// Chrome spawns renderer and GPU helpers that survive the main process; they
/// all carry the profile directory on their command line.
pub fn kill_processes_with_marker(marker: &Path) -> usize {
    let marker = marker.to_string_lossy();
    let mut system = System::new();
    system.refresh_processes();

    let mut killed = 0;
    for process in system.processes().values() {
        if process.cmd().iter().any(|arg| arg.contains(marker.as_ref()))
            && process.kill_with(Signal::Kill).unwrap_or(false)
        {
            killed += 1;
        }
    }
    killed
}

async fn terminate_marked(dir: PathBuf) {
    match tokio::task::spawn_blocking(move || kill_processes_with_marker(&dir)).await {
        Ok(0) => {}
        Ok(n) => debug!("Killed {} leftover browser processes", n),
        Err(e) => warn!("Process cleanup task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cdp_cookie(domain: &str, expires: f64, session: bool) -> Cookie {
        serde_json::from_value(serde_json::json!({
            "name": "_ga",
            "value": "GA1.2.3",
            "domain": domain,
            "path": "/",
            "expires": expires,
            "size": 12,
            "httpOnly": false,
            "secure": true,
            "session": session,
            "sameSite": "Lax",
            "priority": "Medium",
            "sameParty": false,
            "sourceScheme": "Secure",
            "sourcePort": 443
        }))
        .unwrap()
    }

    #[test]
    fn test_cookie_from_any_domain_is_recorded() {
        let record = to_record(&cdp_cookie(".google-analytics.com", 1_900_000_000.0, false));
        assert_eq!(record.name, "_ga");
        assert_eq!(record.host, ".google-analytics.com");
        assert_eq!(record.path, "/");
        assert_eq!(record.expiry, Some(1_900_000_000.0));
        assert!(record.secure);
        assert_eq!(record.same_site.as_deref(), Some("Lax"));

        let session = to_record(&cdp_cookie("example.com", -1.0, true));
        assert!(session.session);
        assert_eq!(session.expiry, None);
    }

    #[test]
    fn test_default_options_are_valid() {
        let options = ChromeOptions::default();
        assert!(options.headless);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_missing_executable_rejected() {
        let options = ChromeOptions {
            executable: Some(PathBuf::from("/nonexistent/chrome-binary")),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(BrowserError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_profile_must_be_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("profile");
        std::fs::write(&file, "not a dir").unwrap();

        let options = ChromeOptions {
            profile_template: Some(file),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_profile_copies_are_isolated() {
        let template = TempDir::new().unwrap();
        std::fs::create_dir_all(template.path().join("Default")).unwrap();
        std::fs::write(template.path().join("Default/Preferences"), "{}").unwrap();

        let root = TempDir::new().unwrap();
        let launcher = ChromeLauncher::new(ChromeOptions {
            profile_template: Some(template.path().to_path_buf()),
            run_root: Some(root.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();

        let a = launcher.prepare_profile(0).unwrap();
        let b = launcher.prepare_profile(0).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(launcher.run_root()));
        assert!(a.join("Default/Preferences").exists());
        assert!(b.join("Default/Preferences").exists());
    }
}
