use super::{ListingSource, SearchPage, SourceError, interpret};
use crate::{
    config::{GuardConfig, SourceConfig},
    guard::{GuardError, Pause, ResilienceGuard, browser_surface::BrowserSurface},
    models::Task,
    session::Session,
    source::api::SEARCH_API,
};
use async_trait::async_trait;
use chromiumoxide::{
    Browser, BrowserConfig, Page,
    cdp::browser_protocol::network::{
        CookieParam, EventResponseReceived, GetResponseBodyParams,
    },
};
use futures::StreamExt;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

const RESPONSE_WAIT: Duration = Duration::from_secs(30);

struct BrowserContext {
    // Kept alive for the lifetime of the page.
    _browser: Browser,
    page: Page,
}

/// Drives the real search page and lifts the search API response off the
/// network event stream. The browser is launched lazily on first use.
pub struct BrowserSource {
    config: SourceConfig,
    headless: bool,
    session: Arc<Session>,
    guard: Arc<ResilienceGuard>,
    context: OnceCell<BrowserContext>,
    navigation: Mutex<()>,
}

impl BrowserSource {
    pub fn new(
        config: SourceConfig,
        guard_config: &GuardConfig,
        session: Arc<Session>,
        guard: Arc<ResilienceGuard>,
    ) -> Self {
        Self {
            config,
            headless: guard_config.headless,
            session,
            guard,
            context: OnceCell::new(),
            navigation: Mutex::new(()),
        }
    }

    async fn context(&self) -> Result<&BrowserContext, SourceError> {
        self.context.get_or_try_init(|| self.launch()).await
    }

    async fn launch(&self) -> Result<BrowserContext, SourceError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(RESPONSE_WAIT)
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled");
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(SourceError::Browser)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| SourceError::Browser(err.to_string()))?;
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|err| SourceError::Browser(err.to_string()))?;
        let cookies: Vec<CookieParam> = self
            .session
            .cookies
            .iter()
            .map(|c| {
                let mut param = CookieParam::new(c.name.clone(), c.value.clone());
                param.domain = Some(c.domain.clone().unwrap_or_else(|| ".goofish.com".into()));
                param.path = Some("/".into());
                param
            })
            .collect();
        if !cookies.is_empty() {
            page.set_cookies(cookies)
                .await
                .map_err(|err| SourceError::Browser(err.to_string()))?;
        }
        info!(target = "argus.source", headless = self.headless, "browser_launched");
        Ok(BrowserContext {
            _browser: browser,
            page,
        })
    }

    /// Runs `action` and returns the body of the next search API response it triggers.
    async fn capture_search<F, Fut>(&self, page: &Page, action: F) -> Result<Value, SourceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), SourceError>>,
    {
        let mut events = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|err| SourceError::Browser(err.to_string()))?;
        action().await?;

        let request_id = tokio::time::timeout(RESPONSE_WAIT, async {
            while let Some(event) = events.next().await {
                if event.response.url.contains(SEARCH_API) {
                    return Some(event.request_id.clone());
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
        .ok_or_else(|| SourceError::Transport("REQUEST_ERROR::search response not observed".into()))?;

        // The body is only retrievable once loading finished.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let body = page
            .execute(GetResponseBodyParams::new(request_id))
            .await
            .map_err(|err| SourceError::Browser(err.to_string()))?;
        let text = if body.result.base64_encoded {
            use base64::Engine as _;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(body.result.body.as_bytes())
                .map_err(|err| SourceError::Browser(err.to_string()))?;
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            body.result.body.clone()
        };
        serde_json::from_str(&text).map_err(|err| SourceError::Upstream(format!("search body: {err}")))
    }

    async fn guard_page(&self, page: &Page) -> Result<(), SourceError> {
        let surface = BrowserSurface::new(page);
        surface.install_error_hook().await;
        self.guard.inspect(&surface).await.map_err(|err| match err {
            GuardError::BotChallenge(marker) => SourceError::BotChallenge(marker),
            GuardError::Blocked(reason) => SourceError::Blocked(reason),
            GuardError::Surface(message) => SourceError::Browser(message),
        })
    }

    async fn open_search(&self, page: &Page, task: &Task) -> Result<Value, SourceError> {
        let url = format!(
            "{}/search?q={}",
            self.config.web_base,
            urlencoding::encode(&task.keyword)
        );
        let target = url.as_str();
        let mut envelope = self
            .capture_search(page, move || async move {
                page.goto(target)
                    .await
                    .map(|_| ())
                    .map_err(|err| SourceError::Browser(err.to_string()))
            })
            .await?;
        self.guard.pause(Pause::PageLoad).await;
        self.guard_page(page).await?;
        let _ = click_text(page, "div[class*='closeIconBg']", None).await;

        let _ = click_text(page, "*", Some("新发布")).await;
        self.guard.pause(Pause::PageLoad).await;
        envelope = self.refilter(page, envelope, "*", Some("最新")).await;

        if task.personal_only {
            envelope = self.refilter(page, envelope, "*", Some("个人闲置")).await;
        }

        if task.min_price.is_some() || task.max_price.is_some() {
            let filled = fill_price(page, task.min_price.as_deref(), task.max_price.as_deref()).await;
            if filled {
                match self
                    .capture_search(page, move || async move {
                        page.evaluate("document.activeElement && document.activeElement.blur()")
                            .await
                            .map(|_| ())
                            .map_err(|err| SourceError::Browser(err.to_string()))
                    })
                    .await
                {
                    Ok(next) => envelope = next,
                    Err(err) => warn!(target = "argus.source", error = %err, "price_filter_no_response"),
                }
            } else {
                warn!(target = "argus.source", "price_inputs_missing");
            }
        }
        Ok(envelope)
    }

    async fn refilter(&self, page: &Page, current: Value, selector: &str, text: Option<&str>) -> Value {
        let outcome = self
            .capture_search(page, move || async move {
                if click_text(page, selector, text).await {
                    Ok(())
                } else {
                    Err(SourceError::Browser(format!("filter control {text:?} missing")))
                }
            })
            .await;
        self.guard.pause(Pause::PageLoad).await;
        match outcome {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target = "argus.source", filter = ?text, error = %err, "filter_not_applied");
                current
            }
        }
    }

    async fn next_page(&self, page: &Page) -> Result<Option<Value>, SourceError> {
        let selector = "[class*='search-pagination-arrow-right']:not([class*='disabled'])";
        let present: bool = page
            .evaluate(format!("!!document.querySelector({})", js_str(selector)))
            .await
            .ok()
            .and_then(|r| r.into_value().ok())
            .unwrap_or(false);
        if !present {
            return Ok(None);
        }
        let envelope = self
            .capture_search(page, move || async move {
                if click_text(page, selector, None).await {
                    Ok(())
                } else {
                    Err(SourceError::Browser("next page arrow vanished".into()))
                }
            })
            .await?;
        self.guard_page(page).await?;
        Ok(Some(envelope))
    }
}

#[async_trait]
impl ListingSource for BrowserSource {
    fn name(&self) -> &'static str {
        "browser"
    }

    /// Page 1 opens and filters the search; later pages advance one arrow
    /// click at a time, so callers must request pages in order.
    async fn fetch(&self, task: &Task, page_no: u32) -> Result<SearchPage, SourceError> {
        let _nav = self.navigation.lock().await;
        let ctx = self.context().await?;
        let envelope = if page_no <= 1 {
            self.open_search(&ctx.page, task).await?
        } else {
            match self.next_page(&ctx.page).await? {
                Some(envelope) => envelope,
                None => {
                    debug!(target = "argus.source", page = page_no, "last_page_reached");
                    return Ok(SearchPage::default());
                }
            }
        };
        interpret(&envelope, "browser")
    }
}

fn js_str(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".into())
}

/// Clicks the first element matching `selector` (and, if given, whose trimmed text equals `text`).
async fn click_text(page: &Page, selector: &str, text: Option<&str>) -> bool {
    let script = format!(
        r#"(() => {{
  const wanted = {text};
  const nodes = Array.from(document.querySelectorAll({selector}));
  const hit = nodes.find((el) => wanted === null || (el.children.length === 0 && (el.textContent || '').trim() === wanted));
  if (!hit) return false;
  hit.click();
  return true;
}})()"#,
        text = text.map(js_str).unwrap_or_else(|| "null".into()),
        selector = js_str(selector),
    );
    page.evaluate(script)
        .await
        .ok()
        .and_then(|r| r.into_value::<bool>().ok())
        .unwrap_or(false)
}

async fn fill_price(page: &Page, min: Option<&str>, max: Option<&str>) -> bool {
    let script = format!(
        r#"(() => {{
  const box = document.querySelector("div[class*='search-price-input-container']");
  if (!box) return false;
  const inputs = box.querySelectorAll("input");
  const set = (input, value) => {{
    if (!input || value === null) return;
    const setter = Object.getOwnPropertyDescriptor(window.HTMLInputElement.prototype, 'value').set;
    setter.call(input, value);
    input.dispatchEvent(new Event('input', {{ bubbles: true }}));
    input.dispatchEvent(new Event('change', {{ bubbles: true }}));
  }};
  set(inputs[0], {min});
  set(inputs[1], {max});
  if (inputs[1]) inputs[1].focus();
  return inputs.length > 0;
}})()"#,
        min = min.map(js_str).unwrap_or_else(|| "null".into()),
        max = max.map(js_str).unwrap_or_else(|| "null".into()),
    );
    page.evaluate(script)
        .await
        .ok()
        .and_then(|r| r.into_value::<bool>().ok())
        .unwrap_or(false)
}
