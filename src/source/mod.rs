//! Search-result retrieval.
//!
//! Both strategies hand back the raw search envelope. Classification of its
//! `ret` markers and normalization of `data.resultList` live here so the API
//! and browser paths cannot drift apart.

pub mod api;
pub mod browser;

use crate::{
    models::{Listing, Task, UNKNOWN, item_id_from_link},
    path,
    safe_path::{array, lookup, str_or},
};
use async_trait::async_trait;
use chrono::{FixedOffset, TimeZone};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use api::{ApiSource, MtopClient};
pub use browser::BrowserSource;

pub const RATE_LIMIT_MARKERS: [&str; 2] = ["RGV587_ERROR", "被挤爆啦"];
pub const BOT_CHALLENGE_MARKER: &str = "FAIL_SYS_USER_VALIDATE";
pub const HTTP_ERROR_PREFIX: &str = "HTTP_ERROR::";
pub const REQUEST_ERROR_PREFIX: &str = "REQUEST_ERROR::";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerClass {
    Ok,
    RateLimited,
    BotChallenge,
    OtherError,
}

/// Classifies an envelope's `ret` markers. Rate limiting wins over a bot
/// challenge, which wins over any other error.
pub fn classify(markers: &[String]) -> MarkerClass {
    let relevant: Vec<&str> = markers
        .iter()
        .map(String::as_str)
        .filter(|m| !m.starts_with("SUCCESS::"))
        .collect();
    if relevant
        .iter()
        .any(|m| RATE_LIMIT_MARKERS.iter().any(|needle| m.contains(needle)))
    {
        MarkerClass::RateLimited
    } else if relevant.iter().any(|m| m.contains(BOT_CHALLENGE_MARKER)) {
        MarkerClass::BotChallenge
    } else if relevant
        .iter()
        .any(|m| m.contains("ERROR") || m.contains("FAIL"))
    {
        MarkerClass::OtherError
    } else {
        MarkerClass::Ok
    }
}

pub fn markers(envelope: &Value) -> Vec<String> {
    array(envelope, path!["ret"])
        .iter()
        .map(|m| match m {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}

pub fn is_transport_marker(marker: &str) -> bool {
    marker.starts_with(HTTP_ERROR_PREFIX) || marker.starts_with(REQUEST_ERROR_PREFIX)
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("bot challenge: {0}")]
    BotChallenge(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("browser: {0}")]
    Browser(String),
    #[error("blocked: {0}")]
    Blocked(String),
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub listings: Vec<Listing>,
    pub markers: Vec<String>,
}

/// Turns a search envelope into a page of listings or a typed failure.
pub fn interpret(envelope: &Value, source: &'static str) -> Result<SearchPage, SourceError> {
    let markers = markers(envelope);
    let joined = markers.join(" | ");
    match classify(&markers) {
        MarkerClass::RateLimited => return Err(SourceError::RateLimited(joined)),
        MarkerClass::BotChallenge => return Err(SourceError::BotChallenge(joined)),
        MarkerClass::OtherError if markers.iter().any(|m| is_transport_marker(m)) => {
            return Err(SourceError::Transport(joined));
        }
        MarkerClass::OtherError => return Err(SourceError::Upstream(joined)),
        MarkerClass::Ok => {}
    }
    let listings = parse_search_results(envelope, source);
    Ok(SearchPage { listings, markers })
}

/// One page of results for `task`. Pages are 1-based.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, task: &Task, page: u32) -> Result<SearchPage, SourceError>;
}

/// API first; falls back to the browser only when the API call never got a
/// real answer from upstream.
pub struct FallbackSource {
    primary: Box<dyn ListingSource>,
    fallback: Box<dyn ListingSource>,
}

impl FallbackSource {
    pub fn new(primary: Box<dyn ListingSource>, fallback: Box<dyn ListingSource>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl ListingSource for FallbackSource {
    fn name(&self) -> &'static str {
        "auto"
    }

    async fn fetch(&self, task: &Task, page: u32) -> Result<SearchPage, SourceError> {
        match self.primary.fetch(task, page).await {
            Err(SourceError::Transport(marker)) => {
                warn!(
                    target = "argus.source",
                    task = %task.task_name,
                    page,
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    marker = %marker,
                    "source_fallback"
                );
                self.fallback.fetch(task, page).await
            }
            other => other,
        }
    }
}

pub fn search_filter(task: &Task) -> Option<String> {
    let mut filter = String::new();
    if task.min_price.is_some() || task.max_price.is_some() {
        filter.push_str(&format!(
            "priceRange:{},{};",
            task.min_price.as_deref().unwrap_or(""),
            task.max_price.as_deref().unwrap_or("")
        ));
    }
    if task.personal_only {
        filter.push_str("sellerType:1;");
    }
    (!filter.is_empty()).then_some(filter)
}

pub fn parse_search_results(envelope: &Value, source: &'static str) -> Vec<Listing> {
    let items = array(envelope, path!["data", "resultList"]);
    if items.is_empty() {
        debug!(target = "argus.source", source, "search_result_list_empty");
        return Vec::new();
    }
    let listings: Vec<Listing> = items
        .iter()
        .filter_map(|item| {
            let listing = parse_item(item);
            if listing.is_none() {
                warn!(target = "argus.source", source, "listing_without_link_dropped");
            }
            listing
        })
        .collect();
    info!(
        target = "argus.source",
        source,
        received = items.len(),
        parsed = listings.len(),
        "search_page_parsed"
    );
    listings
}

static NULL: Value = Value::Null;

fn parse_item(item: &Value) -> Option<Listing> {
    let main = lookup(item, path!["data", "item", "main"])?;
    let content = lookup(main, path!["exContent"]).unwrap_or(&NULL);
    let args = lookup(main, path!["clickParam", "args"]).unwrap_or(&NULL);

    let raw_link = str_or(main, path!["targetUrl"], "");
    if raw_link.is_empty() {
        return None;
    }
    let link = canonical_link(&raw_link);

    let mut tags = Vec::new();
    if str_or(args, path!["tag"], "") == "freeship" {
        tags.push("包邮".to_string());
    }
    for tag in array(content, path!["fishTags", "r1", "tagList"]) {
        if str_or(tag, path!["data", "content"], "").contains("验货宝") {
            tags.push("验货宝".to_string());
        }
    }

    let image_urls = match str_or(content, path!["picUrl"], "") {
        url if url.is_empty() => Vec::new(),
        url => vec![absolute_image_url(&url)],
    };

    let id = match str_or(content, path!["itemId"], "") {
        id if id.is_empty() => item_id_from_link(&link).unwrap_or_else(|| UNKNOWN.into()),
        id => id,
    };

    Some(Listing {
        id,
        title: str_or(content, path!["title"], UNKNOWN),
        price: normalize_price(lookup(content, path!["price"])),
        original_price: str_or(content, path!["oriPrice"], UNKNOWN),
        wants: str_or(args, path!["wantNum"], UNKNOWN),
        seller_name: str_or(content, path!["userNickName"], UNKNOWN),
        area: str_or(content, path!["area"], UNKNOWN),
        link,
        publish_time: format_publish_time(lookup(args, path!["publishTime"])),
        tags,
        image_urls,
    })
}

pub fn canonical_link(raw: &str) -> String {
    raw.replace("fleamarket://", "https://www.goofish.com/")
}

fn absolute_image_url(url: &str) -> String {
    if url.starts_with("//") {
        format!("https:{url}")
    } else {
        url.to_string()
    }
}

/// Joins price parts, drops the current-price label and expands a `万` suffix.
pub fn normalize_price(parts: Option<&Value>) -> String {
    let Some(Value::Array(parts)) = parts else {
        return UNKNOWN.into();
    };
    let joined: String = parts
        .iter()
        .filter_map(|p| match p.get("text") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .collect();
    let price = joined.replace("当前价", "").trim().to_string();
    if price.is_empty() {
        return UNKNOWN.into();
    }
    if price.contains('万') {
        let digits = price.replace(['¥', '万'], "");
        if let Ok(value) = digits.trim().parse::<f64>() {
            return format!("¥{:.0}", value * 10_000.0);
        }
    }
    price
}

/// Millisecond epoch rendered in marketplace local time (UTC+8).
pub fn format_publish_time(raw: Option<&Value>) -> String {
    let millis = match raw {
        Some(Value::String(s)) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
            s.parse::<i64>().ok()
        }
        Some(Value::Number(n)) => n.as_i64(),
        _ => None,
    };
    let offset = FixedOffset::east_opt(8 * 3600);
    match (millis, offset) {
        (Some(ms), Some(tz)) => tz
            .timestamp_millis_opt(ms)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| UNKNOWN.into()),
        _ => UNKNOWN.into(),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{Value, json};

    pub fn search_item(id: &str, title: &str, price_text: &str) -> Value {
        json!({
            "data": {"item": {"main": {
                "targetUrl": format!("fleamarket://item?id={id}&categoryId=1"),
                "exContent": {
                    "itemId": id,
                    "title": title,
                    "price": [{"text": "当前价"}, {"text": "¥"}, {"text": price_text}],
                    "area": "上海",
                    "userNickName": "seller",
                    "picUrl": format!("https://img.example/{id}.jpg"),
                    "oriPrice": "¥15000",
                    "fishTags": {"r1": {"tagList": [{"data": {"content": "验货宝"}}]}}
                },
                "clickParam": {"args": {"publishTime": "1700000000000", "wantNum": "12", "tag": "freeship"}}
            }}}
        })
    }

    pub fn envelope(items: Vec<Value>) -> Value {
        json!({"ret": ["SUCCESS::调用成功"], "data": {"resultList": items}})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn m(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classification_and_precedence() {
        assert_eq!(classify(&[]), MarkerClass::Ok);
        assert_eq!(classify(&m(&["SUCCESS::调用成功"])), MarkerClass::Ok);
        assert_eq!(classify(&m(&["RGV587_ERROR::SM"])), MarkerClass::RateLimited);
        assert_eq!(classify(&m(&["哎哟喂,被挤爆啦,请稍后重试"])), MarkerClass::RateLimited);
        assert_eq!(
            classify(&m(&["FAIL_SYS_USER_VALIDATE", "RGV587_ERROR"])),
            MarkerClass::RateLimited
        );
        assert_eq!(
            classify(&m(&["FAIL_SYS_TOKEN_EXOIRED", "FAIL_SYS_USER_VALIDATE"])),
            MarkerClass::BotChallenge
        );
        assert_eq!(classify(&m(&["HTTP_ERROR::503"])), MarkerClass::OtherError);
    }

    #[test]
    fn interpret_maps_transport_markers() {
        let env = json!({"ret": ["REQUEST_ERROR::timed out"], "data": {}});
        assert!(matches!(interpret(&env, "test"), Err(SourceError::Transport(_))));
        let env = json!({"ret": ["FAIL_SYS_ILLEGAL_ACCESS"], "data": {}});
        assert!(matches!(interpret(&env, "test"), Err(SourceError::Upstream(_))));
    }

    #[test]
    fn normalizes_a_full_item() {
        let env = fixtures::envelope(vec![fixtures::search_item("42", "Sony A7M4", "1.15万")]);
        let page = interpret(&env, "test").expect("ok");
        let listing = &page.listings[0];
        assert_eq!(listing.id, "42");
        assert_eq!(listing.price, "¥11500");
        assert_eq!(listing.link, "https://www.goofish.com/item?id=42&categoryId=1");
        assert_eq!(listing.publish_time, "2023-11-15 06:13");
        assert_eq!(listing.tags, vec!["包邮".to_string(), "验货宝".to_string()]);
        assert_eq!(listing.wants, "12");
    }

    #[test]
    fn malformed_records_use_sentinels_and_linkless_are_dropped() {
        let env = json!({"data": {"resultList": [
            {"data": {"item": {"main": {"targetUrl": "https://www.goofish.com/item?id=7", "exContent": {"price": "oops"}}}}},
            {"data": {"item": {"main": {"exContent": {"title": "no link"}}}}},
            "garbage"
        ]}});
        let listings = parse_search_results(&env, "test");
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].title, UNKNOWN);
        assert_eq!(listings[0].price, UNKNOWN);
        assert_eq!(listings[0].id, "7");
        assert_eq!(listings[0].publish_time, UNKNOWN);
    }

    #[test]
    fn filter_encoding() {
        let mut task: Task = serde_json::from_value(json!({
            "task_name": "t", "keyword": "a7m4", "min_price": "10000", "personal_only": true
        }))
        .expect("task");
        assert_eq!(search_filter(&task).as_deref(), Some("priceRange:10000,;sellerType:1;"));
        task.personal_only = false;
        task.min_price = None;
        assert_eq!(search_filter(&task), None);
    }
}
