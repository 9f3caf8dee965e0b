//! Minimal W3C WebDriver client: spawns a driver binary (geckodriver or
//! chromedriver), opens one session and issues the handful of commands the
//! portal fetcher needs.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use reqwest::Method;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::domain::{CssSelector, SnapshotRequest};
use crate::error::LdmError;
use crate::fetcher::{BrowserLauncher, BrowserSession};

/// Key under which W3C drivers return element references.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const ZIP_MIME_TYPES: &str = "application/zip,application/x-zip-compressed,application/octet-stream";

pub struct DriverProcess {
    child: Child,
    port: u16,
    log: File,
}

impl DriverProcess {
    pub fn spawn(command: &str, port: u16) -> Result<Self, LdmError> {
        ensure_port_free(port)?;
        let program = resolve_program(command)
            .ok_or_else(|| LdmError::MissingTool(command.to_string()))?;

        let log = tempfile::tempfile().map_err(|err| LdmError::Filesystem(err.to_string()))?;
        let stderr = log
            .try_clone()
            .map_err(|err| LdmError::Filesystem(err.to_string()))?;
        let child = Command::new(&program)
            .arg(format!("--port={port}"))
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|err| LdmError::DriverStartup {
                port,
                message: format!("spawn {}: {err}", program.display()),
            })?;
        debug!(program = %program.display(), port, "driver spawned");
        Ok(Self { child, port, log })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Polls `/status` until the driver reports ready, failing early if the
    /// process exits.
    pub fn wait_ready(&mut self, client: &WebDriverClient, timeout: Duration) -> Result<(), LdmError> {
        let start = Instant::now();
        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(LdmError::DriverStartup {
                    port: self.port,
                    message: format!("driver exited with {status}: {}", self.log_tail()),
                });
            }
            if client.status().unwrap_or(false) {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(LdmError::DriverStartup {
                    port: self.port,
                    message: format!("driver not ready after {}s", timeout.as_secs()),
                });
            }
            thread::sleep(Duration::from_millis(250));
        }
    }

    fn log_tail(&mut self) -> String {
        let mut content = String::new();
        if self.log.seek(SeekFrom::Start(0)).is_ok() {
            let _ = self.log.read_to_string(&mut content);
        }
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return "no output".to_string();
        }
        let lines = trimmed.lines().collect::<Vec<_>>();
        lines[lines.len().saturating_sub(5)..].join(" | ")
    }
}

impl Drop for DriverProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[derive(Clone)]
pub struct WebDriverClient {
    http: Client,
    base_url: String,
}

impl WebDriverClient {
    pub fn new(port: u16) -> Result<Self, LdmError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .no_proxy()
            .build()
            .map_err(|err| LdmError::Http(err.to_string()))?;
        Ok(Self {
            http,
            base_url: format!("http://127.0.0.1:{port}"),
        })
    }

    pub fn status(&self) -> Result<bool, LdmError> {
        let value = self.send(Method::GET, "/status", None)?;
        Ok(value.get("ready").and_then(Value::as_bool).unwrap_or(false))
    }

    pub fn new_session(&self, capabilities: Value) -> Result<String, LdmError> {
        let body = json!({ "capabilities": { "alwaysMatch": capabilities } });
        let value = self.send(Method::POST, "/session", Some(body))?;
        value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LdmError::WebDriver {
                error: "invalid response".to_string(),
                message: "new session response carried no sessionId".to_string(),
            })
    }

    /// Sends a command and unwraps the `value` member of the response.
    fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, LdmError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .map_err(|err| LdmError::Http(err.to_string()))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .map_err(|err| LdmError::Http(format!("{url}: {err}")))?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(value);
        }
        Err(command_error(&value))
    }
}

fn command_error(value: &Value) -> LdmError {
    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if error == "no such element" {
        return LdmError::ElementNotFound(message);
    }
    LdmError::WebDriver { error, message }
}

pub struct WebDriverSession {
    client: WebDriverClient,
    session_id: String,
    driver: Option<DriverProcess>,
    closed: bool,
}

impl WebDriverSession {
    /// Opens a session on a driver that is already listening.
    pub fn start(client: WebDriverClient, capabilities: Value) -> Result<Self, LdmError> {
        let session_id = client.new_session(capabilities)?;
        debug!(session_id = %session_id, "browser session opened");
        Ok(Self {
            client,
            session_id,
            driver: None,
            closed: false,
        })
    }

    /// Ties the driver process to the session so it stops once the session is deleted.
    pub fn with_driver(mut self, driver: DriverProcess) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn navigate(&mut self, url: &str) -> Result<(), LdmError> {
        let path = format!("/session/{}/url", self.session_id);
        self.client
            .send(Method::POST, &path, Some(json!({ "url": url })))?;
        Ok(())
    }

    pub fn find_element(&self, selector: &CssSelector) -> Result<String, LdmError> {
        let path = format!("/session/{}/element", self.session_id);
        let body = json!({ "using": "css selector", "value": selector.as_str() });
        let value = self.client.send(Method::POST, &path, Some(body))?;
        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LdmError::ElementNotFound(selector.to_string()))
    }

    pub fn click_element(&self, element_id: &str) -> Result<(), LdmError> {
        let path = format!("/session/{}/element/{}/click", self.session_id, element_id);
        self.client.send(Method::POST, &path, Some(json!({})))?;
        Ok(())
    }

    fn delete(&mut self) -> Result<(), LdmError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let path = format!("/session/{}", self.session_id);
        let result = self.client.send(Method::DELETE, &path, None).map(|_| ());
        self.driver.take();
        result
    }
}

impl BrowserSession for WebDriverSession {
    fn navigate(&mut self, url: &str) -> Result<(), LdmError> {
        WebDriverSession::navigate(self, url)
    }

    fn click(&mut self, selector: &CssSelector) -> Result<(), LdmError> {
        let element = self.find_element(selector)?;
        self.click_element(&element)
    }

    fn close(&mut self) -> Result<(), LdmError> {
        self.delete()
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if let Err(err) = self.delete() {
            warn!(error = %err, "failed to close browser session");
        }
    }
}

/// Starts a local driver process and opens a headless session that saves
/// zip downloads straight into the staging directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebDriverLauncher;

impl BrowserLauncher for WebDriverLauncher {
    fn launch(
        &self,
        download_dir: &Utf8Path,
        request: &SnapshotRequest,
    ) -> Result<Box<dyn BrowserSession>, LdmError> {
        let mut driver = DriverProcess::spawn(&request.driver_command, request.port)?;
        let client = WebDriverClient::new(request.port)?;
        driver.wait_ready(&client, READY_TIMEOUT)?;

        let capabilities = capabilities_for(&request.driver_command, download_dir);
        let session = WebDriverSession::start(client, capabilities).map_err(|err| {
            LdmError::DriverStartup {
                port: request.port,
                message: format!("could not open browser session: {err}"),
            }
        })?;
        Ok(Box::new(session.with_driver(driver)))
    }
}

pub fn capabilities_for(driver_command: &str, download_dir: &Utf8Path) -> Value {
    if driver_command.contains("chromedriver") {
        return json!({
            "browserName": "chrome",
            "goog:chromeOptions": {
                "args": ["--headless=new", "--disable-gpu", "--no-sandbox"],
                "prefs": {
                    "download.default_directory": download_dir.as_str(),
                    "download.prompt_for_download": false,
                    "safebrowsing.enabled": true
                }
            }
        });
    }
    json!({
        "browserName": "firefox",
        "acceptInsecureCerts": true,
        "moz:firefoxOptions": {
            "args": ["-headless"],
            "prefs": {
                "browser.download.folderList": 2,
                "browser.download.dir": download_dir.as_str(),
                "browser.download.useDownloadDir": true,
                "browser.download.manager.showWhenStarting": false,
                "browser.helperApps.neverAsk.saveToDisk": ZIP_MIME_TYPES,
                "pdfjs.disabled": true
            }
        }
    })
}

fn ensure_port_free(port: u16) -> Result<(), LdmError> {
    TcpListener::bind(("127.0.0.1", port))
        .map(drop)
        .map_err(|err| LdmError::DriverStartup {
            port,
            message: format!("port is not available: {err}"),
        })
}

fn resolve_program(command: &str) -> Option<PathBuf> {
    let direct = Path::new(command);
    if direct.components().count() > 1 {
        return direct.exists().then(|| direct.to_path_buf());
    }
    find_in_path(command)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firefox_prefs_point_at_download_dir() {
        let caps = capabilities_for("geckodriver", Utf8Path::new("/tmp/ldm"));
        let prefs = &caps["moz:firefoxOptions"]["prefs"];
        assert_eq!(prefs["browser.download.dir"], "/tmp/ldm");
        assert_eq!(prefs["browser.download.folderList"], 2);
    }

    #[test]
    fn chrome_prefs_point_at_download_dir() {
        let caps = capabilities_for("/usr/bin/chromedriver", Utf8Path::new("/tmp/ldm"));
        assert_eq!(caps["browserName"], "chrome");
        assert_eq!(
            caps["goog:chromeOptions"]["prefs"]["download.default_directory"],
            "/tmp/ldm"
        );
    }

    #[test]
    fn missing_driver_binary_is_reported() {
        let err = resolve_program("definitely-not-a-webdriver-binary");
        assert!(err.is_none());
    }

    #[test]
    fn bound_port_is_rejected() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(matches!(
            ensure_port_free(port),
            Err(LdmError::DriverStartup { .. })
        ));
    }

    #[test]
    fn no_such_element_maps_to_not_found() {
        let value = json!({ "error": "no such element", "message": "#missing" });
        assert!(matches!(command_error(&value), LdmError::ElementNotFound(_)));
    }
}
