use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

/// One monitoring target, as handed over by the task-configuration collaborator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Task {
    pub task_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub keyword: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub personal_only: bool,
    #[serde(default, deserialize_with = "de_price")]
    pub min_price: Option<String>,
    #[serde(default, deserialize_with = "de_price")]
    pub max_price: Option<String>,
    #[serde(default)]
    pub ai_prompt_text: String,
    #[serde(default)]
    pub debug_limit: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_max_pages() -> u32 {
    1
}

/// Accepts `"10000"`, `10000` or empty for a price bound.
fn de_price<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Search-result summary. Unknown fields hold [`UNKNOWN`] rather than failing the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: String,
    pub title: String,
    pub price: String,
    pub original_price: String,
    pub wants: String,
    pub seller_name: String,
    pub area: String,
    pub link: String,
    pub publish_time: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

pub const UNKNOWN: &str = "unknown";

/// Dedup identity: the link up to its first `&`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ListingKey(String);

impl ListingKey {
    pub fn from_link(link: &str) -> Self {
        let stable = link.split_once('&').map(|(head, _)| head).unwrap_or(link);
        Self(stable.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ListingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SellerProfile {
    pub seller_id: Option<String>,
    pub nickname: Option<String>,
    pub tenure: String,
    pub zhima_credit: Option<String>,
    #[serde(default)]
    pub credit_tags: Vec<String>,
    pub item_count: Option<i64>,
    pub rating_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailRecord {
    pub capture_time: DateTime<Utc>,
    pub task_name: String,
    pub keyword: String,
    pub listing: Listing,
    pub seller_profile: SellerProfile,
}

/// Outcome of the AI step as persisted in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Judgement {
    Verdict { verdict: Verdict },
    Error { #[serde(rename = "errorMarker")] error_marker: String },
}

impl Judgement {
    pub fn error(marker: impl Into<String>) -> Self {
        Judgement::Error {
            error_marker: marker.into(),
        }
    }

    /// Fail-closed: only a verdict whose `is_recommended` is literally `true` counts.
    pub fn is_recommended(&self) -> bool {
        match self {
            Judgement::Verdict { verdict } => verdict.is_recommended(),
            Judgement::Error { .. } => false,
        }
    }
}

/// The model's structured judgement. `body` keeps the object exactly as returned so
/// nothing the model said is lost; `validated` records whether it passed the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub validated: bool,
    pub body: Value,
}

impl Verdict {
    /// Only a schema-valid verdict with a boolean `true` counts.
    pub fn is_recommended(&self) -> bool {
        self.validated && matches!(self.body.get("is_recommended"), Some(Value::Bool(true)))
    }

    pub fn reason(&self) -> String {
        self.body
            .get("reason")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("no reason given")
            .to_string()
    }

    pub fn risk_tags(&self) -> Vec<String> {
        self.body
            .get("risk_tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One line of the per-task ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub record: DetailRecord,
    #[serde(flatten)]
    pub judgement: Judgement,
}

impl LedgerEntry {
    pub fn key(&self) -> ListingKey {
        ListingKey::from_link(&self.record.listing.link)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub title: String,
    pub price: String,
    pub reason: String,
    pub link: String,
    pub mobile_link: Option<String>,
    pub icon: Option<String>,
}

impl NotificationEvent {
    pub fn from_record(record: &DetailRecord, reason: &str, to_mobile: bool) -> Self {
        let listing = &record.listing;
        Self {
            title: listing.title.clone(),
            price: listing.price.clone(),
            reason: reason.to_string(),
            link: listing.link.clone(),
            mobile_link: to_mobile.then(|| mobile_link(&listing.link)),
            icon: listing.image_urls.first().cloned(),
        }
    }

    pub fn headline(&self) -> String {
        let short: String = self.title.chars().take(30).collect();
        format!("🚨 New recommendation! {short}...")
    }

    /// Plain-text body shared by the text-oriented channels.
    pub fn message(&self) -> String {
        match &self.mobile_link {
            Some(mobile) => format!(
                "Price: {}\nReason: {}\nMobile link: {}\nDesktop link: {}",
                self.price, self.reason, mobile, self.link
            ),
            None => format!(
                "Price: {}\nReason: {}\nLink: {}",
                self.price, self.reason, self.link
            ),
        }
    }

    pub fn preferred_link(&self) -> &str {
        self.mobile_link.as_deref().unwrap_or(&self.link)
    }
}

/// Rewrites a desktop item link into the mobile share page for the same item id.
pub fn mobile_link(link: &str) -> String {
    let Some(id) = item_id_from_link(link) else {
        return link.to_string();
    };
    let bfp = urlencoding::encode(&format!("{{\"id\":{id}}}")).into_owned();
    format!(
        "https://pages.goofish.com/sharexy?loadingVisible=false&bft=item&bfs=idlepc.item&spm=a21ybx.item.0.0&bfp={bfp}"
    )
}

pub fn item_id_from_link(link: &str) -> Option<String> {
    let parsed = url::Url::parse(link).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == "id")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

/// What one finished task run reports back to the scheduler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskRunSummary {
    pub task_name: String,
    pub processed: usize,
    pub already_seen: usize,
    pub skipped: usize,
    pub notified: usize,
    pub stages: Vec<StageReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_drops_everything_after_first_ampersand() {
        let a = ListingKey::from_link("https://x/item?id=1&ref=a");
        let b = ListingKey::from_link("https://x/item?id=1&ref=b");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://x/item?id=1");
    }

    #[test]
    fn key_without_delimiter_is_whole_link() {
        let solo = ListingKey::from_link("https://x/item?id=1");
        assert_eq!(solo.as_str(), "https://x/item?id=1");
        assert_ne!(solo, ListingKey::from_link("https://x/item?id=2&ref=a"));
    }

    #[test]
    fn recommendation_is_fail_closed() {
        let stringy = Verdict {
            validated: false,
            body: json!({"is_recommended": "true"}),
        };
        assert!(!stringy.is_recommended());
        let unvalidated = Verdict {
            validated: false,
            body: json!({"is_recommended": true}),
        };
        assert!(!unvalidated.is_recommended());
        assert!(!Judgement::error("invalid").is_recommended());
        let real = Judgement::Verdict {
            verdict: Verdict {
                validated: true,
                body: json!({"is_recommended": true}),
            },
        };
        assert!(real.is_recommended());
    }

    #[test]
    fn task_accepts_numeric_prices() {
        let task: Task = serde_json::from_value(json!({
            "task_name": "Sony A7M4",
            "keyword": "A7M4",
            "min_price": 10000,
            "max_price": "13000",
        }))
        .expect("task");
        assert_eq!(task.min_price.as_deref(), Some("10000"));
        assert_eq!(task.max_price.as_deref(), Some("13000"));
        assert_eq!(task.max_pages, 1);
        assert!(task.enabled);
    }

    #[test]
    fn mobile_link_encodes_item_id() {
        let link = mobile_link("https://www.goofish.com/item?id=123&categoryId=5");
        assert!(link.contains("bfp=%7B%22id%22%3A123%7D"));
        assert_eq!(mobile_link("https://x/none"), "https://x/none");
    }

    #[test]
    fn ledger_entry_shape() {
        let entry = LedgerEntry {
            record: DetailRecord {
                capture_time: Utc::now(),
                task_name: "t".into(),
                keyword: "k".into(),
                listing: Listing {
                    id: "1".into(),
                    title: "t".into(),
                    price: "¥1".into(),
                    original_price: UNKNOWN.into(),
                    wants: UNKNOWN.into(),
                    seller_name: "s".into(),
                    area: UNKNOWN.into(),
                    link: "https://x/item?id=1&a=b".into(),
                    publish_time: UNKNOWN.into(),
                    tags: vec![],
                    image_urls: vec![],
                },
                seller_profile: SellerProfile::default(),
            },
            judgement: Judgement::error("ai_invalid_response"),
        };
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["errorMarker"], "ai_invalid_response");
        assert!(value.get("captureTime").is_some());
        let back: LedgerEntry = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back.key().as_str(), "https://x/item?id=1");
    }
}
