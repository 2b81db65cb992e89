use super::{BoundingBox, GuardError, PageProbe, PageSurface};
use async_trait::async_trait;
use chromiumoxide::{Page, layout::Point};

/// Collects uncaught script errors into `window.__argusErrors`; installed after each navigation.
pub const ERROR_HOOK_JS: &str = r#"(() => {
  if (window.__argusErrors) { return true; }
  window.__argusErrors = [];
  window.addEventListener('error', (e) => window.__argusErrors.push(String(e.message || e)));
  const original = console.error;
  console.error = function (...args) {
    window.__argusErrors.push(args.map(String).join(' '));
    return original.apply(console, args);
  };
  return true;
})()"#;

pub struct BrowserSurface<'p> {
    page: &'p Page,
}

impl<'p> BrowserSurface<'p> {
    pub fn new(page: &'p Page) -> Self {
        Self { page }
    }

    pub async fn install_error_hook(&self) {
        let _ = self.page.evaluate(ERROR_HOOK_JS).await;
    }
}

fn selectors_json(selectors: &[String]) -> String {
    serde_json::to_string(selectors).unwrap_or_else(|_| "[]".into())
}

fn probe_script(selectors: &[String]) -> String {
    format!(
        r#"(() => {{
  const selectors = {list};
  const visible = (el) => {{
    if (!el) return false;
    const rect = el.getBoundingClientRect();
    const style = window.getComputedStyle(el);
    return rect.width > 0 && rect.height > 0 && style.visibility !== 'hidden' && style.display !== 'none';
  }};
  const hits = selectors.filter((s) => {{
    try {{ return Array.from(document.querySelectorAll(s)).some(visible); }} catch (e) {{ return false; }}
  }});
  return {{
    visible_selectors: hits,
    title: document.title || '',
    url: window.location.href,
    script_errors: (window.__argusErrors || []).slice(-50),
    body_text: document.body ? document.body.innerText.slice(0, 20000) : ''
  }};
}})()"#,
        list = selectors_json(selectors)
    )
}

fn box_script(selectors: &[String]) -> String {
    format!(
        r#"(() => {{
  for (const s of {list}) {{
    let nodes = [];
    try {{ nodes = Array.from(document.querySelectorAll(s)); }} catch (e) {{ continue; }}
    for (const el of nodes) {{
      const r = el.getBoundingClientRect();
      if (r.width > 0 && r.height > 0) return {{ x: r.x, y: r.y, width: r.width, height: r.height }};
    }}
  }}
  return null;
}})()"#,
        list = selectors_json(selectors)
    )
}

#[async_trait]
impl PageSurface for BrowserSurface<'_> {
    async fn probe(&self, selectors: &[String]) -> Result<PageProbe, GuardError> {
        self.page
            .evaluate(probe_script(selectors))
            .await
            .map_err(|err| GuardError::Surface(err.to_string()))?
            .into_value::<PageProbe>()
            .map_err(|err| GuardError::Surface(err.to_string()))
    }

    async fn element_box(&self, selectors: &[String]) -> Option<BoundingBox> {
        self.page
            .evaluate(box_script(selectors))
            .await
            .ok()?
            .into_value::<Option<BoundingBox>>()
            .ok()
            .flatten()
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<(), GuardError> {
        self.page
            .click(Point::new(x, y))
            .await
            .map(|_| ())
            .map_err(|err| GuardError::Surface(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_embed_selectors_as_json() {
        let selectors = vec!["div[class*='verify']".to_string()];
        let script = probe_script(&selectors);
        assert!(script.contains(r#"["div[class*='verify']"]"#));
        assert!(box_script(&[]).contains("for (const s of []"));
    }
}
