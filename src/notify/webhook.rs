use super::{NotificationChannel, NotifyError, ensure_success};
use crate::{config::WebhookSettings, models::NotificationEvent};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{Map, Value};
use url::Url;

/// Operator-defined HTTP endpoint with `${title}`/`${content}` templates.
pub struct Webhook {
    http: Client,
    settings: WebhookSettings,
}

impl Webhook {
    pub fn new(http: Client, settings: WebhookSettings) -> Self {
        Self { http, settings }
    }

    fn request(&self, title: &str, content: &str) -> Result<RequestBuilder, NotifyError> {
        let settings = &self.settings;
        let mut request = match settings.method.as_str() {
            "GET" => {
                let mut url = Url::parse(&settings.url)
                    .map_err(|err| NotifyError::Config(format!("url: {err}")))?;
                if let Some(template) = &settings.query_parameters {
                    let params = render_object(template, title, content, "query parameters")?;
                    let mut pairs = url.query_pairs_mut();
                    for (key, value) in &params {
                        pairs.append_pair(key, &plain(value));
                    }
                }
                self.http.get(url)
            }
            "POST" => {
                let mut request = self.http.post(&settings.url);
                if let Some(template) = &settings.body {
                    let body = render_object(template, title, content, "body")?;
                    request = match settings.content_type.as_str() {
                        "JSON" => request.json(&body),
                        "FORM" => {
                            let form: Vec<(String, String)> =
                                body.iter().map(|(k, v)| (k.clone(), plain(v))).collect();
                            request.form(&form)
                        }
                        other => {
                            return Err(NotifyError::Config(format!("content type `{other}`")));
                        }
                    };
                }
                request
            }
            other => return Err(NotifyError::Config(format!("method `{other}`"))),
        };

        if let Some(raw) = &settings.headers {
            let headers: Map<String, Value> = serde_json::from_str(raw)
                .map_err(|err| NotifyError::Config(format!("headers: {err}")))?;
            for (name, value) in &headers {
                request = request.header(name.as_str(), plain(value));
            }
        }
        Ok(request)
    }
}

/// Substitutes both placeholder styles with JSON-escaped text (no surrounding quotes).
pub fn substitute(template: &str, title: &str, content: &str) -> String {
    let title = json_escape(title);
    let content = json_escape(content);
    template
        .replace("${title}", &title)
        .replace("{{title}}", &title)
        .replace("${content}", &content)
        .replace("{{content}}", &content)
}

fn render_object(
    template: &str,
    title: &str,
    content: &str,
    what: &str,
) -> Result<Map<String, Value>, NotifyError> {
    let rendered = substitute(template, title, content);
    match serde_json::from_str::<Value>(&rendered) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(NotifyError::Config(format!("{what} template is not a JSON object"))),
        Err(err) => Err(NotifyError::Config(format!("{what} template: {err}"))),
    }
}

fn json_escape(text: &str) -> String {
    let quoted = serde_json::to_string(text).unwrap_or_default();
    quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(&quoted)
        .to_string()
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl NotificationChannel for Webhook {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let request = self.request(&event.headline(), &event.message())?;
        ensure_success(request.send().await?).map(|_| ())
    }
}
