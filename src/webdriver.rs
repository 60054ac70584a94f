//! W3C WebDriver backend.
//!
//! [`WebDriverSession`] speaks the WebDriver wire protocol to a running
//! chromedriver over blocking HTTP and implements [`Browser`].
//! [`DriverBootstrap`] makes sure a driver is listening (optionally spawning
//! the binary) exactly once, and [`WebDriverFactory`] hands out one session
//! per worker on top of it. [`XPathPageReader`] extracts records from the
//! rendered search results.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use reqwest::Method;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::browser::{Browser, BrowserFactory, Cookie, ElementHandle, PageReader};
use crate::config::WebDriverConfig;
use crate::error::{HarvestError, Result};
use crate::model::Record;

/// JSON key identifying a web element reference.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4a4ab0e3b9a1";

/// Rendered search result.
pub const ARTICLE_XPATH: &str = "//article[@data-testid='tweet']";

const STATUS_LINK_XPATH: &str = ".//a[contains(@href, '/status/')]";
const USER_NAME_XPATH: &str = ".//div[@data-testid='User-Name']//span";
const HANDLE_XPATH: &str = ".//span[contains(text(), '@')]";
const TIME_XPATH: &str = ".//time";
const SHOW_MORE_XPATH: &str = ".//span[contains(text(), 'Show more')]";
const TEXT_XPATH: &str = ".//div[@data-testid='tweetText']";

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const DRIVER_READY_TIMEOUT: Duration = Duration::from_secs(15);

const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight);";
const HEIGHT_SCRIPT: &str = "return document.body.scrollHeight;";

/// Session capabilities for a Chrome instance.
#[must_use]
pub fn capabilities(config: &WebDriverConfig) -> Value {
    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        format!("--window-size={}", config.window_size),
    ];
    if config.headless {
        args.insert(0, "--headless=new".to_string());
    }
    if !config.user_agent.is_empty() {
        args.push(format!("--user-agent={}", config.user_agent));
    }

    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                "goog:chromeOptions": { "args": args }
            }
        }
    })
}

/// Map a WebDriver error payload to an error variant.
fn protocol_error(value: &Value, status: u16) -> HarvestError {
    let code = value
        .get("error")
        .and_then(Value::as_str)
        .map_or_else(|| format!("http {status}"), str::to_string);
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match code.as_str() {
        "stale element reference" => HarvestError::StaleElement(message),
        "no such element" => HarvestError::ElementNotFound(message),
        _ => HarvestError::Driver { code, message },
    }
}

fn element_handles(value: &Value) -> Vec<ElementHandle> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(ELEMENT_KEY).and_then(Value::as_str))
                .map(|id| ElementHandle(id.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// One WebDriver session, i.e. one browser window.
pub struct WebDriverSession {
    client: Client,
    base_url: String,
    session_id: String,
    closed: bool,
}

impl WebDriverSession {
    /// Open a new session against the driver at `base_url`.
    ///
    /// # Errors
    ///
    /// Fails when the driver is unreachable or refuses the capabilities.
    pub fn start(base_url: &str, config: &WebDriverConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let value = send(&client, &base_url, Method::POST, "/session", Some(capabilities(config)))?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| HarvestError::Driver {
                code: "session not created".to_string(),
                message: "driver response carried no session id".to_string(),
            })?
            .to_string();

        debug!(session = %session_id, "WebDriver session started");
        Ok(Self {
            client,
            base_url,
            session_id,
            closed: false,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.session_id
    }

    fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let path = format!("/session/{}{path}", self.session_id);
        send(&self.client, &self.base_url, method, &path, body)
    }

    fn execute(&self, script: &str) -> Result<Value> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": [] })),
        )
    }
}

fn send(client: &Client, base_url: &str, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
    let mut request = client.request(method, format!("{base_url}{path}"));
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().map_err(|e| {
        if e.is_connect() {
            HarvestError::driver_unavailable(base_url, e.to_string())
        } else {
            HarvestError::Http(e)
        }
    })?;
    let status = response.status();
    let payload: Value = response.json().unwrap_or(Value::Null);
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        Ok(value)
    } else {
        Err(protocol_error(&value, status.as_u16()))
    }
}

impl Browser for WebDriverSession {
    fn navigate(&mut self, url: &str) -> Result<()> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))?;
        Ok(())
    }

    fn add_cookie(&mut self, cookie: &Cookie) -> Result<()> {
        let body = json!({
            "cookie": {
                "name": cookie.name,
                "value": cookie.value,
                "domain": cookie.domain,
                "path": "/",
            }
        });
        self.command(Method::POST, "/cookie", Some(body))?;
        Ok(())
    }

    fn wait_for_results(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.results()?.is_empty() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn results(&mut self) -> Result<Vec<ElementHandle>> {
        let value = self.command(
            Method::POST,
            "/elements",
            Some(json!({ "using": "xpath", "value": ARTICLE_XPATH })),
        )?;
        Ok(element_handles(&value))
    }

    fn scroll_to_bottom(&mut self) -> Result<()> {
        self.execute(SCROLL_SCRIPT)?;
        Ok(())
    }

    fn page_height(&mut self) -> Result<u64> {
        let value = self.execute(HEIGHT_SCRIPT)?;
        Ok(value.as_u64().unwrap_or_default())
    }

    fn find_within(&mut self, element: &ElementHandle, xpath: &str) -> Result<Vec<ElementHandle>> {
        let value = self.command(
            Method::POST,
            &format!("/element/{}/elements", element.0),
            Some(json!({ "using": "xpath", "value": xpath })),
        )?;
        Ok(element_handles(&value))
    }

    fn text(&mut self, element: &ElementHandle) -> Result<String> {
        let value = self.command(Method::GET, &format!("/element/{}/text", element.0), None)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn attribute(&mut self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
        let value = self.command(
            Method::GET,
            &format!("/element/{}/attribute/{name}", element.0),
            None,
        )?;
        Ok(value.as_str().map(str::to_string))
    }

    fn click(&mut self, element: &ElementHandle) -> Result<()> {
        self.command(Method::POST, &format!("/element/{}/click", element.0), Some(json!({})))?;
        Ok(())
    }

    fn quit(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        send(
            &self.client,
            &self.base_url,
            Method::DELETE,
            &format!("/session/{}", self.session_id),
            None,
        )?;
        debug!(session = %self.session_id, "WebDriver session closed");
        Ok(())
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if let Err(e) = self.quit() {
            debug!(session = %self.session_id, error = %e, "Failed to close WebDriver session");
        }
    }
}

/// Port of a `http://host:port` url.
fn port_of(url: &str) -> Option<u16> {
    let authority = url.split("://").nth(1).unwrap_or(url);
    let host_port = authority.split('/').next()?;
    host_port.rsplit_once(':')?.1.parse().ok()
}

/// Makes a driver available at the configured url, once.
///
/// When `driver_path` is set and nothing answers at the url yet, the binary
/// is launched on the url's port and killed again when the bootstrap is
/// dropped. The outcome of the first successful call is cached; later calls
/// return immediately.
pub struct DriverBootstrap {
    config: WebDriverConfig,
    ready: OnceCell<String>,
    child: Mutex<Option<Child>>,
}

impl DriverBootstrap {
    #[must_use]
    pub fn new(config: WebDriverConfig) -> Self {
        Self {
            config,
            ready: OnceCell::new(),
            child: Mutex::new(None),
        }
    }

    /// True once [`DriverBootstrap::ensure`] has succeeded.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.get().is_some()
    }

    /// Url of a driver that answers `/status`.
    ///
    /// # Errors
    ///
    /// Fails when no driver answers and none could be launched.
    pub fn ensure(&self) -> Result<&str> {
        self.ready
            .get_or_try_init(|| self.bootstrap())
            .map(String::as_str)
    }

    fn bootstrap(&self) -> Result<String> {
        let url = self.config.url.trim_end_matches('/').to_string();
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;

        if driver_ready(&client, &url) {
            info!(url = %url, "Using running WebDriver");
            return Ok(url);
        }

        let Some(path) = &self.config.driver_path else {
            return Err(HarvestError::driver_unavailable(
                &url,
                "no driver is listening and no driver_path is configured",
            ));
        };
        let port = port_of(&url).ok_or_else(|| {
            HarvestError::invalid_argument(format!("WebDriver url '{url}' has no port"))
        })?;

        info!(driver = %path.display(), port, "Launching WebDriver");
        let child = Command::new(path)
            .arg(format!("--port={port}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HarvestError::path_error("launch", path, e))?;
        *self.child.lock() = Some(child);

        let deadline = Instant::now() + DRIVER_READY_TIMEOUT;
        while Instant::now() < deadline {
            if driver_ready(&client, &url) {
                return Ok(url);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Err(HarvestError::driver_unavailable(
            &url,
            format!("driver did not become ready within {}s", DRIVER_READY_TIMEOUT.as_secs()),
        ))
    }
}

fn driver_ready(client: &Client, url: &str) -> bool {
    send(client, url, Method::GET, "/status", None)
        .map(|value| value.get("ready").and_then(Value::as_bool).unwrap_or(true))
        .unwrap_or(false)
}

impl Drop for DriverBootstrap {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.kill() {
                warn!(error = %e, "Failed to stop WebDriver");
            }
            let _ = child.wait();
        }
    }
}

/// Creates one [`WebDriverSession`] per worker.
pub struct WebDriverFactory {
    bootstrap: Arc<DriverBootstrap>,
}

impl WebDriverFactory {
    #[must_use]
    pub fn new(config: WebDriverConfig) -> Self {
        Self::with_bootstrap(Arc::new(DriverBootstrap::new(config)))
    }

    #[must_use]
    pub const fn with_bootstrap(bootstrap: Arc<DriverBootstrap>) -> Self {
        Self { bootstrap }
    }
}

impl BrowserFactory for WebDriverFactory {
    fn prepare(&self) -> Result<()> {
        self.bootstrap.ensure().map(|_| ())
    }

    fn create(&self, worker_id: usize) -> Result<Box<dyn Browser>> {
        let url = self.bootstrap.ensure()?;
        let session = WebDriverSession::start(url, &self.bootstrap.config)?;
        debug!(worker = worker_id, session = %session.id(), "Browser ready");
        Ok(Box::new(session))
    }
}

/// Reads result articles through XPath lookups.
#[derive(Debug, Default, Clone, Copy)]
pub struct XPathPageReader;

fn first(browser: &mut dyn Browser, scope: &ElementHandle, xpath: &str) -> Result<Option<ElementHandle>> {
    Ok(browser.find_within(scope, xpath)?.into_iter().next())
}

fn required(browser: &mut dyn Browser, scope: &ElementHandle, xpath: &str) -> Result<ElementHandle> {
    first(browser, scope, xpath)?.ok_or_else(|| HarvestError::ElementNotFound(xpath.to_string()))
}

fn count(browser: &mut dyn Browser, scope: &ElementHandle, test_id: &str) -> Result<String> {
    let xpath = format!(".//button[@data-testid='{test_id}']");
    let text = match first(browser, scope, &xpath)? {
        Some(button) => browser.text(&button)?,
        None => String::new(),
    };
    let text = text.trim();
    Ok(if text.is_empty() { "0".to_string() } else { text.to_string() })
}

impl XPathPageReader {
    fn extract(browser: &mut dyn Browser, article: &ElementHandle) -> Result<Option<Record>> {
        let Some(link) = first(browser, article, STATUS_LINK_XPATH)? else {
            return Ok(None);
        };
        let url = browser.attribute(&link, "href")?.unwrap_or_default();
        if url.trim().is_empty() {
            return Ok(None);
        }

        let name_el = required(browser, article, USER_NAME_XPATH)?;
        let author_name = browser.text(&name_el)?;
        let handle_el = required(browser, article, HANDLE_XPATH)?;
        let author_handle = browser.text(&handle_el)?;
        let time_el = required(browser, article, TIME_XPATH)?;
        let posted_at = browser.attribute(&time_el, "datetime")?.unwrap_or_default();

        // Truncated posts expand in place; a failed click keeps the short text.
        if let Some(show_more) = first(browser, article, SHOW_MORE_XPATH)? {
            if let Err(e) = browser.click(&show_more) {
                debug!(error = %e, "Could not expand post");
            }
        }

        let text_el = required(browser, article, TEXT_XPATH)?;
        let text = browser.text(&text_el)?.replace('\n', " ");

        Ok(Some(Record {
            url,
            author_name,
            author_handle,
            posted_at,
            text,
            reply_count: count(browser, article, "reply")?,
            repost_count: count(browser, article, "retweet")?,
            like_count: count(browser, article, "like")?,
        }))
    }
}

impl PageReader for XPathPageReader {
    fn read(&self, browser: &mut dyn Browser, element: &ElementHandle) -> Option<Record> {
        match Self::extract(browser, element) {
            Ok(record) => record.filter(Record::is_valid),
            Err(e) if e.is_element_error() => {
                warn!(error = %e, "Failed to parse a post, skipping");
                None
            }
            Err(e) => {
                error!(error = %e, "Driver error while reading a post, skipping");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Page whose elements are keyed by `"{scope}|{xpath}"`.
    #[derive(Default)]
    struct FakePage {
        children: HashMap<String, Vec<ElementHandle>>,
        texts: HashMap<String, String>,
        attributes: HashMap<(String, String), String>,
        clicks: Vec<String>,
        stale: bool,
    }

    impl FakePage {
        fn child(&mut self, scope: &str, xpath: &str, id: &str) {
            self.children
                .entry(format!("{scope}|{xpath}"))
                .or_default()
                .push(ElementHandle(id.to_string()));
        }

        fn text_of(&mut self, id: &str, text: &str) {
            self.texts.insert(id.to_string(), text.to_string());
        }

        fn attr(&mut self, id: &str, name: &str, value: &str) {
            self.attributes
                .insert((id.to_string(), name.to_string()), value.to_string());
        }
    }

    impl Browser for FakePage {
        fn navigate(&mut self, _url: &str) -> Result<()> {
            Ok(())
        }
        fn add_cookie(&mut self, _cookie: &Cookie) -> Result<()> {
            Ok(())
        }
        fn wait_for_results(&mut self, _timeout: Duration) -> Result<bool> {
            Ok(true)
        }
        fn results(&mut self) -> Result<Vec<ElementHandle>> {
            Ok(Vec::new())
        }
        fn scroll_to_bottom(&mut self) -> Result<()> {
            Ok(())
        }
        fn page_height(&mut self) -> Result<u64> {
            Ok(0)
        }
        fn find_within(&mut self, element: &ElementHandle, xpath: &str) -> Result<Vec<ElementHandle>> {
            if self.stale {
                return Err(HarvestError::StaleElement(element.0.clone()));
            }
            Ok(self
                .children
                .get(&format!("{}|{xpath}", element.0))
                .cloned()
                .unwrap_or_default())
        }
        fn text(&mut self, element: &ElementHandle) -> Result<String> {
            Ok(self.texts.get(&element.0).cloned().unwrap_or_default())
        }
        fn attribute(&mut self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
            Ok(self
                .attributes
                .get(&(element.0.clone(), name.to_string()))
                .cloned())
        }
        fn click(&mut self, element: &ElementHandle) -> Result<()> {
            self.clicks.push(element.0.clone());
            Ok(())
        }
        fn quit(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn full_article() -> FakePage {
        let mut page = FakePage::default();
        page.child("a", STATUS_LINK_XPATH, "link");
        page.attr("link", "href", "https://x.com/budi/status/1");
        page.child("a", USER_NAME_XPATH, "name");
        page.text_of("name", "Budi");
        page.child("a", HANDLE_XPATH, "handle");
        page.text_of("handle", "@budi");
        page.child("a", TIME_XPATH, "time");
        page.attr("time", "datetime", "2024-01-02T03:04:05.000Z");
        page.child("a", TEXT_XPATH, "text");
        page.text_of("text", "line one\nline two");
        page.child("a", ".//button[@data-testid='reply']", "reply");
        page.text_of("reply", "4");
        page.child("a", ".//button[@data-testid='like']", "like");
        page.text_of("like", "1.2K");
        page
    }

    #[test]
    fn reads_a_complete_article() {
        let mut page = full_article();
        let record = XPathPageReader
            .read(&mut page, &ElementHandle("a".into()))
            .unwrap();

        assert_eq!(record.url, "https://x.com/budi/status/1");
        assert_eq!(record.author_name, "Budi");
        assert_eq!(record.author_handle, "@budi");
        assert_eq!(record.posted_at, "2024-01-02T03:04:05.000Z");
        assert_eq!(record.text, "line one line two");
        assert_eq!(record.reply_count, "4");
        assert_eq!(record.repost_count, "0");
        assert_eq!(record.like_count, "1.2K");
    }

    #[test]
    fn expands_truncated_posts() {
        let mut page = full_article();
        page.child("a", SHOW_MORE_XPATH, "more");
        XPathPageReader.read(&mut page, &ElementHandle("a".into())).unwrap();
        assert_eq!(page.clicks, vec!["more".to_string()]);
    }

    #[test]
    fn article_without_status_link_is_skipped() {
        let mut page = full_article();
        page.children.remove(&format!("a|{STATUS_LINK_XPATH}"));
        assert!(XPathPageReader.read(&mut page, &ElementHandle("a".into())).is_none());
    }

    #[test]
    fn missing_text_or_stale_article_is_skipped() {
        let mut page = full_article();
        page.children.remove(&format!("a|{TEXT_XPATH}"));
        assert!(XPathPageReader.read(&mut page, &ElementHandle("a".into())).is_none());

        let mut page = full_article();
        page.stale = true;
        assert!(XPathPageReader.read(&mut page, &ElementHandle("a".into())).is_none());
    }

    #[test]
    fn capabilities_carry_chrome_arguments() {
        let config = WebDriverConfig::default();
        let caps = capabilities(&config);
        let args = caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap();
        let args: Vec<&str> = args.iter().filter_map(Value::as_str).collect();
        assert_eq!(args[0], "--headless=new");
        assert!(args.contains(&"--window-size=1920,1080"));
        assert!(args.iter().any(|a| a.starts_with("--user-agent=")));

        let headed = WebDriverConfig {
            headless: false,
            ..WebDriverConfig::default()
        };
        let caps = capabilities(&headed);
        assert!(!caps.to_string().contains("--headless"));
    }

    #[test]
    fn protocol_errors_are_classified() {
        let stale = json!({ "error": "stale element reference", "message": "gone" });
        assert!(matches!(protocol_error(&stale, 404), HarvestError::StaleElement(m) if m == "gone"));

        let missing = json!({ "error": "no such element", "message": "nope" });
        assert!(matches!(protocol_error(&missing, 404), HarvestError::ElementNotFound(_)));

        let other = json!({ "error": "invalid session id", "message": "" });
        assert!(matches!(
            protocol_error(&other, 404),
            HarvestError::Driver { code, .. } if code == "invalid session id"
        ));

        assert!(matches!(
            protocol_error(&Value::Null, 500),
            HarvestError::Driver { code, .. } if code == "http 500"
        ));
    }

    #[test]
    fn element_references_are_extracted() {
        let value = json!([{ ELEMENT_KEY: "e1" }, { "other": "x" }, { ELEMENT_KEY: "e2" }]);
        assert_eq!(
            element_handles(&value),
            vec![ElementHandle("e1".into()), ElementHandle("e2".into())]
        );
        assert!(element_handles(&json!({})).is_empty());
    }

    #[test]
    fn port_is_parsed_from_url() {
        assert_eq!(port_of("http://localhost:9515"), Some(9515));
        assert_eq!(port_of("http://127.0.0.1:4444/wd/hub"), Some(4444));
        assert_eq!(port_of("http://localhost"), None);
    }

    #[test]
    fn bootstrap_without_driver_fails_and_is_not_cached() {
        let config = WebDriverConfig {
            url: "http://127.0.0.1:1".to_string(),
            driver_path: None,
            ..WebDriverConfig::default()
        };
        let bootstrap = DriverBootstrap::new(config);
        assert!(matches!(
            bootstrap.ensure(),
            Err(HarvestError::DriverUnavailable { .. })
        ));
        assert!(!bootstrap.is_ready());
    }
}
