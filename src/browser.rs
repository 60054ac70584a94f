//! Browser abstraction used by the collectors.
//!
//! A [`Browser`] is one live page owned by exactly one worker. The collector
//! only needs a handful of operations: navigate, wait for results, list the
//! rendered result elements, scroll, and measure the page. Element-level
//! lookups used by page readers are part of the same trait so readers can
//! work against any backend.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{HarvestError, Result};
use crate::model::Record;

/// Opaque reference to a rendered element. Only meaningful to the browser
/// that returned it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle(pub String);

/// A cookie to inject before searching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

impl Cookie {
    /// The session cookie that authenticates search requests.
    #[must_use]
    pub fn auth_token(value: &str) -> Self {
        Self {
            name: "auth_token".to_string(),
            value: value.to_string(),
            domain: ".x.com".to_string(),
        }
    }
}

/// One browser page.
pub trait Browser: Send {
    /// Load `url` and block until the driver reports the navigation done.
    fn navigate(&mut self, url: &str) -> Result<()>;

    fn add_cookie(&mut self, cookie: &Cookie) -> Result<()>;

    /// Wait until at least one search result is rendered. `Ok(false)` on
    /// timeout.
    fn wait_for_results(&mut self, timeout: Duration) -> Result<bool>;

    /// Result elements currently rendered, in page order.
    fn results(&mut self) -> Result<Vec<ElementHandle>>;

    fn scroll_to_bottom(&mut self) -> Result<()>;

    /// Current scrollable height of the document.
    fn page_height(&mut self) -> Result<u64>;

    /// Descendants of `element` matching an XPath expression.
    fn find_within(&mut self, _element: &ElementHandle, _xpath: &str) -> Result<Vec<ElementHandle>> {
        Err(HarvestError::Unsupported("find_within"))
    }

    /// Rendered text of an element.
    fn text(&mut self, _element: &ElementHandle) -> Result<String> {
        Err(HarvestError::Unsupported("text"))
    }

    /// Attribute value of an element, `None` when absent.
    fn attribute(&mut self, _element: &ElementHandle, _name: &str) -> Result<Option<String>> {
        Err(HarvestError::Unsupported("attribute"))
    }

    fn click(&mut self, _element: &ElementHandle) -> Result<()> {
        Err(HarvestError::Unsupported("click"))
    }

    /// Close the page and release the browser process.
    fn quit(&mut self) -> Result<()>;
}

/// Creates browsers for pool workers.
pub trait BrowserFactory: Send + Sync {
    /// One-time, expensive setup shared by every browser (driver install or
    /// launch). Called once per harvest before any worker starts; must be
    /// idempotent.
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Start a new browser for `worker_id`.
    fn create(&self, worker_id: usize) -> Result<Box<dyn Browser>>;
}

/// Turns a rendered result element into a record.
///
/// Implementations must not fail: a missing sub-element or a stale
/// reference yields `None` and a log line.
pub trait PageReader: Send + Sync {
    fn read(&self, browser: &mut dyn Browser, element: &ElementHandle) -> Option<Record>;
}

/// Cooperative cancellation flag shared by every worker of a harvest.
///
/// Cancelling wakes threads blocked in [`CancelToken::sleep`], so a scroll
/// pause ends early instead of running to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `duration` or until cancelled. Returns true if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let mut cancelled = flag.lock();
        if !*cancelled && !duration.is_zero() {
            let _ = cvar.wait_while_for(&mut cancelled, |c| !*c, duration);
        }
        *cancelled
    }
}
