//! Browser handle management
//!
//! Binds a Chromium instance to a session's virtual display (or runs it
//! headless), discovers the DevTools endpoint, and drives one page over
//! the remote-debugging channel. Page-level action failures are reported
//! as data in the `ActionResult`, never raised past this boundary.

use std::path::Path;
use std::pin::Pin;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventScreencastFrame, ScreencastFrameAckParams,
    StartScreencastFormat, StartScreencastParams, StopScreencastParams,
};
use chromiumoxide::cdp::js_protocol::runtime as cdp_runtime;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::{Stream, StreamExt};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use browsercast_common::{
    ActionKind, ActionRequest, ActionResult, Coordinates, Error, PageContent, PageElement,
    Resolution, Result, Viewport,
};

use crate::config::{BrowserConfig, StreamConfig};
use crate::supervisor::SupervisedProcess;

/// Element extraction script; restricted to elements with a non-zero
/// rendered size so returned coordinates are clickable.
const INTERACTIVE_ELEMENTS_JS: &str = r#"(() => {
    const elements = [];
    const selectors = ['a', 'button', 'input', 'select', 'textarea', '[onclick]', '[role="button"]'];
    selectors.forEach(selector => {
        document.querySelectorAll(selector).forEach((el, index) => {
            const rect = el.getBoundingClientRect();
            if (rect.width > 0 && rect.height > 0) {
                elements.push({
                    type: el.tagName.toLowerCase(),
                    selector: `${selector}:nth-of-type(${index + 1})`,
                    text: el.textContent ? el.textContent.trim().substring(0, 50) : null,
                    value: el.value !== undefined ? String(el.value) : null,
                    position: {
                        x: rect.x + rect.width / 2,
                        y: rect.y + rect.height / 2
                    },
                    attributes: {
                        href: el.href,
                        placeholder: el.placeholder,
                        type: el.type
                    }
                });
            }
        });
    });
    return elements;
})()"#;

/// Everything produced by a browser launch. The caller takes ownership
/// of the Chromium process (it belongs to the session's process set, so
/// teardown can kill it without going through the handle).
pub struct BrowserLaunch {
    pub process: SupervisedProcess,
    pub profile_dir: TempDir,
    pub handle: BrowserHandle,
}

/// One session's attachment to its browser engine: the CDP connection
/// and the single page it drives.
pub struct BrowserHandle {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    console_task: JoinHandle<()>,
    closed: bool,
}

/// Build the Chromium argument list
pub fn chromium_args(
    devtools_port: u16,
    resolution: Resolution,
    profile_dir: &Path,
    headless: bool,
) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={devtools_port}"),
        format!("--user-data-dir={}", profile_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        format!("--window-size={},{}", resolution.width, resolution.height),
        "--window-position=0,0".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    args
}

/// Validate that a request carries the parameters its action requires.
/// Violations are reported as data by the caller, not raised.
pub fn validate(request: &ActionRequest) -> std::result::Result<(), String> {
    match request.kind {
        ActionKind::Navigate => {
            let url = request.value.as_deref().unwrap_or_default();
            if url.is_empty() {
                return Err("navigate requires a target URL in `value`".to_string());
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(format!("unsupported URL scheme: {url}"));
            }
        }
        ActionKind::Click => {
            if request.selector.is_none() && request.coordinates.is_none() {
                return Err("click requires a selector or coordinates".to_string());
            }
        }
        ActionKind::Type => {
            if request.selector.is_none() && request.coordinates.is_none() {
                return Err("type requires a selector or coordinates".to_string());
            }
            if request.value.is_none() {
                return Err("type requires text in `value`".to_string());
            }
        }
        ActionKind::Press | ActionKind::Evaluate => {
            if request.value.is_none() {
                return Err(format!("{} requires `value`", request.kind));
            }
        }
        ActionKind::Scroll | ActionKind::Screenshot | ActionKind::Wait => {}
    }
    Ok(())
}

impl BrowserHandle {
    /// Spawn a Chromium bound to `display` (or headless when `None`),
    /// wait for its DevTools endpoint, attach over the debugging channel
    /// and open the session's page.
    pub async fn launch(
        display: Option<u32>,
        devtools_port: u16,
        resolution: Resolution,
        config: &BrowserConfig,
    ) -> Result<BrowserLaunch> {
        let profile_dir = tempfile::Builder::new()
            .prefix("browsercast-profile-")
            .tempdir()?;

        let binary = config
            .binary_path
            .clone()
            .unwrap_or_else(|| "chromium".to_string());

        let headless = display.is_none();
        let mut command = Command::new(&binary);
        command.args(chromium_args(
            devtools_port,
            resolution,
            profile_dir.path(),
            headless,
        ));
        if let Some(slot) = display {
            command.env("DISPLAY", format!(":{slot}"));
        }

        let process = SupervisedProcess::spawn("chromium", command)?;

        let ws_url = wait_for_devtools(
            devtools_port,
            Duration::from_secs(config.connect_timeout_secs),
        )
        .await?;

        let (browser, mut handler) = Browser::connect(ws_url.as_str())
            .await
            .map_err(|e| Error::Browser(format!("CDP connect failed: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(result) = handler.next().await {
                if let Err(e) = result {
                    debug!("CDP handler: {e}");
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| Error::Browser(format!("failed to open page: {e}")))?;

        let console_task = spawn_console_forwarder(page.clone());

        Ok(BrowserLaunch {
            process,
            profile_dir,
            handle: Self {
                browser,
                page,
                handler_task,
                console_task,
                closed: false,
            },
        })
    }

    /// Execute one action. Failures come back as
    /// `ActionResult { success: false, .. }`, never as an error.
    pub async fn execute(&self, request: &ActionRequest) -> ActionResult {
        if let Err(message) = validate(request) {
            return ActionResult::failed(request.kind, message);
        }

        let mut result = match self.dispatch(request).await {
            Ok(result) => result,
            Err(e) => {
                warn!("action {} failed: {}", request.kind, e);
                ActionResult::failed(request.kind, e.to_string())
            }
        };

        // Current page info rides along on every result, best-effort.
        if result.url.is_none() {
            result.url = self.page.url().await.ok().flatten();
        }
        if result.title.is_none() {
            result.title = self.page.get_title().await.ok().flatten();
        }
        if result.viewport.is_none() {
            result.viewport = self.viewport().await.ok();
        }
        result
    }

    async fn dispatch(&self, request: &ActionRequest) -> Result<ActionResult> {
        match request.kind {
            ActionKind::Navigate => {
                let url = request.value.as_deref().unwrap_or_default();
                self.page
                    .goto(url)
                    .await
                    .map_err(|e| Error::ActionFailed(format!("navigation failed: {e}")))?;
                let _ = self.page.wait_for_navigation().await;
                let mut result = ActionResult::ok(ActionKind::Navigate);
                result.url = self.page.url().await.ok().flatten();
                Ok(result)
            }
            ActionKind::Click => {
                let (x, y) = match (&request.selector, request.coordinates) {
                    (Some(selector), _) => self.element_center(selector).await?,
                    (None, Some(c)) => (c.x, c.y),
                    (None, None) => unreachable!("checked by validate"),
                };
                self.mouse_click(x, y).await?;
                Ok(ActionResult::ok(ActionKind::Click))
            }
            ActionKind::Type => {
                let text = request.value.as_deref().unwrap_or_default();
                match (&request.selector, request.coordinates) {
                    (Some(selector), _) => self.focus(selector).await?,
                    (None, Some(c)) => self.mouse_click(c.x, c.y).await?,
                    (None, None) => unreachable!("checked by validate"),
                }
                self.type_text(text).await?;
                Ok(ActionResult::ok(ActionKind::Type))
            }
            ActionKind::Scroll => {
                let (dx, dy) = request
                    .coordinates
                    .map(|c| (c.x, c.y))
                    .unwrap_or((0.0, 100.0));
                self.page
                    .evaluate(format!("window.scrollBy({dx}, {dy}); true").as_str())
                    .await
                    .map_err(|e| Error::ActionFailed(format!("scroll failed: {e}")))?;
                Ok(ActionResult::ok(ActionKind::Scroll))
            }
            ActionKind::Screenshot => {
                let bytes = self
                    .page
                    .screenshot(
                        ScreenshotParams::builder()
                            .format(CaptureScreenshotFormat::Png)
                            .full_page(false)
                            .build(),
                    )
                    .await
                    .map_err(|e| Error::ActionFailed(format!("screenshot failed: {e}")))?;
                let mut result = ActionResult::ok(ActionKind::Screenshot);
                result.screenshot = Some(BASE64.encode(&bytes));
                Ok(result)
            }
            ActionKind::Wait => {
                let seconds = match request.value.as_deref() {
                    Some(v) => v
                        .parse::<f64>()
                        .map_err(|_| Error::ActionFailed(format!("invalid wait duration: {v:?}")))?,
                    None => 1.0,
                };
                // Cap so a typo cannot pin the session's action lane.
                let seconds = seconds.clamp(0.0, 30.0);
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                Ok(ActionResult::ok(ActionKind::Wait))
            }
            ActionKind::Press => {
                let key = request.value.as_deref().unwrap_or_default();
                self.press_key(key).await?;
                Ok(ActionResult::ok(ActionKind::Press))
            }
            ActionKind::Evaluate => {
                let expression = request.value.as_deref().unwrap_or_default();
                let evaluation = self
                    .page
                    .evaluate(expression)
                    .await
                    .map_err(|e| Error::ActionFailed(format!("evaluate failed: {e}")))?;
                let mut result = ActionResult::ok(ActionKind::Evaluate);
                // Expressions yielding undefined have no JSON value.
                result.value = evaluation.into_value::<serde_json::Value>().ok();
                Ok(result)
            }
        }
    }

    /// Extract page URL, title, text and interactive elements for
    /// grounding next-action decisions in on-screen geometry.
    pub async fn introspect(&self) -> Result<PageContent> {
        let elements: Vec<PageElement> = self
            .page
            .evaluate(INTERACTIVE_ELEMENTS_JS)
            .await
            .map_err(|e| Error::Browser(format!("element extraction failed: {e}")))?
            .into_value()
            .unwrap_or_default();

        let text_content: String = self
            .page
            .evaluate("document.body ? document.body.innerText : ''")
            .await
            .map_err(|e| Error::Browser(format!("text extraction failed: {e}")))?
            .into_value()
            .unwrap_or_default();

        Ok(PageContent {
            url: self.page.url().await.ok().flatten().unwrap_or_default(),
            title: self.page.get_title().await.ok().flatten().unwrap_or_default(),
            elements,
            text_content,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Start the native screencast and return the frame feed. The feed
    /// must be acknowledged frame-by-frame or the source stops emitting.
    pub async fn start_screencast(&self, stream: &StreamConfig) -> Result<ScreencastFeed> {
        let events = self
            .page
            .event_listener::<EventScreencastFrame>()
            .await
            .map_err(|e| Error::Browser(format!("screencast listener failed: {e}")))?;

        self.page
            .execute(StartScreencastParams {
                format: Some(StartScreencastFormat::Jpeg),
                quality: Some(stream.quality as i64),
                max_width: Some(stream.max_width as i64),
                max_height: Some(stream.max_height as i64),
                every_nth_frame: Some(stream.every_nth_frame as i64),
            })
            .await
            .map_err(|e| Error::Browser(format!("screencast start failed: {e}")))?;

        debug!("screencast started");
        Ok(ScreencastFeed {
            page: self.page.clone(),
            events: Box::pin(events),
        })
    }

    async fn viewport(&self) -> Result<Viewport> {
        self.page
            .evaluate("({ width: window.innerWidth, height: window.innerHeight })")
            .await
            .map_err(|e| Error::Browser(e.to_string()))?
            .into_value()
            .map_err(|e| Error::Browser(format!("{e:?}")))
    }

    /// Resolve a selector to its rendered center, in screen space.
    async fn element_center(&self, selector: &str) -> Result<(f64, f64)> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return null;
                const r = el.getBoundingClientRect();
                if (r.width === 0 || r.height === 0) return null;
                return {{ x: r.x + r.width / 2, y: r.y + r.height / 2 }};
            }})()"#,
            sel = serde_json::to_string(selector)?
        );

        let center: Option<Coordinates> = self
            .page
            .evaluate(script.as_str())
            .await
            .map_err(|e| Error::ActionFailed(format!("selector lookup failed: {e}")))?
            .into_value()
            .unwrap_or(None);

        match center {
            Some(c) => Ok((c.x, c.y)),
            None => Err(Error::ActionFailed(format!(
                "no visible element matches selector {selector:?}"
            ))),
        }
    }

    async fn focus(&self, selector: &str) -> Result<()> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                el.focus();
                return true;
            }})()"#,
            sel = serde_json::to_string(selector)?
        );

        let focused: bool = self
            .page
            .evaluate(script.as_str())
            .await
            .map_err(|e| Error::ActionFailed(format!("focus failed: {e}")))?
            .into_value()
            .unwrap_or(false);

        if !focused {
            return Err(Error::ActionFailed(format!(
                "no element matches selector {selector:?}"
            )));
        }
        Ok(())
    }

    async fn mouse_click(&self, x: f64, y: f64) -> Result<()> {
        let press = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MousePressed)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(|e| Error::Browser(e.to_string()))?;
        self.page
            .execute(press)
            .await
            .map_err(|e| Error::ActionFailed(format!("click failed: {e}")))?;

        let release = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseReleased)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(|e| Error::Browser(e.to_string()))?;
        self.page
            .execute(release)
            .await
            .map_err(|e| Error::ActionFailed(format!("click failed: {e}")))?;

        trace!("clicked at ({x}, {y})");
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        for c in text.chars() {
            let down = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::KeyDown)
                .text(c.to_string())
                .build()
                .map_err(|e| Error::Browser(e.to_string()))?;
            self.page
                .execute(down)
                .await
                .map_err(|e| Error::ActionFailed(format!("type failed: {e}")))?;

            let up = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::KeyUp)
                .text(c.to_string())
                .build()
                .map_err(|e| Error::Browser(e.to_string()))?;
            self.page
                .execute(up)
                .await
                .map_err(|e| Error::ActionFailed(format!("type failed: {e}")))?;
        }
        trace!("typed {} characters", text.chars().count());
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .key(key)
            .build()
            .map_err(|e| Error::Browser(e.to_string()))?;
        self.page
            .execute(down)
            .await
            .map_err(|e| Error::ActionFailed(format!("press failed: {e}")))?;

        let up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(key)
            .build()
            .map_err(|e| Error::Browser(e.to_string()))?;
        self.page
            .execute(up)
            .await
            .map_err(|e| Error::ActionFailed(format!("press failed: {e}")))?;
        Ok(())
    }

    /// Release the page and debugging channel. Safe to call more than
    /// once; later calls are no-ops. The Chromium process itself is
    /// owned and terminated by the session.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Bounded: the engine may already be gone.
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            self.page.execute(StopScreencastParams::default()),
        )
        .await;
        let _ = tokio::time::timeout(Duration::from_secs(2), self.browser.close()).await;

        self.console_task.abort();
        self.handler_task.abort();
        debug!("browser handle closed");
    }
}

/// One acknowledged screencast frame feed
pub struct ScreencastFeed {
    page: Page,
    events: Pin<Box<dyn Stream<Item = Arc<EventScreencastFrame>> + Send + Sync>>,
}

impl ScreencastFeed {
    pub async fn next(&mut self) -> Option<Arc<EventScreencastFrame>> {
        self.events.next().await
    }

    /// Release the next frame from the capture source. Issued once per
    /// frame, immediately after broadcast, never batched.
    pub async fn ack(&self, capture_session: i64) {
        if let Err(e) = self
            .page
            .execute(ScreencastFrameAckParams {
                session_id: capture_session,
            })
            .await
        {
            debug!("screencast ack failed: {e}");
        }
    }
}

/// Forward page console output into the daemon log
fn spawn_console_forwarder(page: Page) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _ = page.execute(cdp_runtime::EnableParams::default()).await;
        if let Ok(mut events) = page
            .event_listener::<cdp_runtime::EventConsoleApiCalled>()
            .await
        {
            while let Some(event) = events.next().await {
                let text = serde_json::to_string(&event.args).unwrap_or_default();
                debug!("browser console [{:?}]: {}", event.r#type, text);
            }
        }
    })
}

/// Poll the DevTools endpoint until it reports its WebSocket debugger
/// URL or the deadline passes.
async fn wait_for_devtools(port: u16, timeout: Duration) -> Result<String> {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}/json/version");
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Ok(response) = client.get(&url).send().await {
            if let Ok(body) = response.json::<serde_json::Value>().await {
                if let Some(ws_url) = body.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    debug!("DevTools ready on port {}", port);
                    return Ok(ws_url.to_string());
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout {
                seconds: timeout.as_secs(),
            });
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: ActionKind) -> ActionRequest {
        ActionRequest {
            kind,
            selector: None,
            value: None,
            coordinates: None,
        }
    }

    #[test]
    fn navigate_requires_http_url() {
        let mut req = request(ActionKind::Navigate);
        assert!(validate(&req).is_err());

        req.value = Some("file:///etc/passwd".to_string());
        assert!(validate(&req).is_err());

        req.value = Some("https://example.test".to_string());
        assert!(validate(&req).is_ok());
    }

    #[test]
    fn click_requires_target() {
        let mut req = request(ActionKind::Click);
        assert!(validate(&req).is_err());

        req.coordinates = Some(Coordinates { x: 1.0, y: 2.0 });
        assert!(validate(&req).is_ok());

        req.coordinates = None;
        req.selector = Some("#submit".to_string());
        assert!(validate(&req).is_ok());
    }

    #[test]
    fn type_requires_target_and_text() {
        let mut req = request(ActionKind::Type);
        req.selector = Some("input".to_string());
        assert!(validate(&req).is_err());

        req.value = Some("hello".to_string());
        assert!(validate(&req).is_ok());
    }

    #[test]
    fn parameterless_actions_validate() {
        assert!(validate(&request(ActionKind::Screenshot)).is_ok());
        assert!(validate(&request(ActionKind::Scroll)).is_ok());
        assert!(validate(&request(ActionKind::Wait)).is_ok());
    }

    #[test]
    fn chromium_args_bind_port_and_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let args = chromium_args(
            9321,
            Resolution {
                width: 1280,
                height: 720,
            },
            dir.path(),
            false,
        );
        assert!(args.contains(&"--remote-debugging-port=9321".to_string()));
        assert!(args.contains(&"--window-size=1280,720".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
    }

    #[test]
    fn chromium_args_headless_mode() {
        let dir = tempfile::tempdir().unwrap();
        let args = chromium_args(9321, Resolution::default(), dir.path(), true);
        assert!(args.contains(&"--headless=new".to_string()));
    }
}
