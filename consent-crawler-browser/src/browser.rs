use crate::error::{BrowserError, Result};
use crate::result::CookieRecord;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const PAGE_SOURCE_SCRIPT: &str = "document.documentElement.outerHTML";
const CURRENT_URL_SCRIPT: &str = "window.location.href";
// Cross-origin frames throw on contentDocument and are skipped
const FRAME_SOURCES_SCRIPT: &str = "Array.from(document.querySelectorAll('iframe')).map(f => { try { return f.contentDocument.documentElement.outerHTML; } catch (e) { return null; } }).filter(h => typeof h === 'string')";

/// A single automated browser page.
///
/// Everything the crawler needs is built on three primitives: navigate,
/// evaluate and read cookies. Implementations must be usable from one task at
/// a time; the worker slot owning the browser guarantees that.
#[async_trait]
pub trait Browser: Send {
    /// Load `url` in the page, failing with [`BrowserError::NavigationTimeout`]
    /// once `timeout` elapses.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()>;

    /// Evaluate a script in the top frame and return its JSON value.
    async fn evaluate(&mut self, script: &str) -> Result<Value>;

    /// Snapshot of every cookie visible to the browser.
    async fn read_cookies(&mut self) -> Result<Vec<CookieRecord>>;

    /// Forcefully terminate the browser and every process it spawned.
    async fn kill(&mut self);

    /// Graceful shutdown after a finished visit.
    async fn close(&mut self) -> Result<()> {
        self.kill().await;
        Ok(())
    }

    async fn page_source(&mut self) -> Result<String> {
        match self.evaluate(PAGE_SOURCE_SCRIPT).await? {
            Value::String(html) => Ok(html),
            other => Err(BrowserError::Script(format!(
                "page source is not a string: {}",
                other
            ))),
        }
    }

    /// Markup of every iframe the top document can read.
    async fn frame_sources(&mut self) -> Result<Vec<String>> {
        match self.evaluate(FRAME_SOURCES_SCRIPT).await? {
            Value::Array(frames) => Ok(frames
                .into_iter()
                .filter_map(|frame| match frame {
                    Value::String(html) => Some(html),
                    _ => None,
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn current_url(&mut self) -> Result<String> {
        match self.evaluate(CURRENT_URL_SCRIPT).await? {
            Value::String(url) => Ok(url),
            other => Err(BrowserError::Script(format!(
                "location is not a string: {}",
                other
            ))),
        }
    }
}

/// Starts browsers for worker slots.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launch a fresh, isolated browser for `worker_id`.
    async fn launch(&self, worker_id: usize) -> Result<Box<dyn Browser>>;

    /// Launch a visible browser on the persistent profile, used to prime it by hand.
    async fn launch_interactive(&self) -> Result<Box<dyn Browser>>;
}
