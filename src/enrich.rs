use crate::{
    models::{DetailRecord, Listing, SellerProfile, Task, UNKNOWN, item_id_from_link},
    path,
    retry::RetryPolicy,
    safe_path::{array, i64_or, lookup, str_or},
    source::{BOT_CHALLENGE_MARKER, MarkerClass, MtopClient, api::DETAIL_API, classify, markers},
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum EnrichError {
    /// The account itself is being challenged; the run must stop.
    #[error("account risk signal: {0}")]
    AccountRisk(String),
    #[error("detail unavailable: {0}")]
    Transient(String),
}

impl EnrichError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EnrichError::Transient(_))
    }
}

#[async_trait]
pub trait DetailEnricher: Send + Sync {
    async fn enrich(&self, task: &Task, listing: &Listing) -> Result<DetailRecord, EnrichError>;
}

pub struct MtopEnricher {
    client: MtopClient,
    retry: RetryPolicy,
}

impl MtopEnricher {
    pub fn new(client: MtopClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    async fn fetch_once(&self, item_id: &str) -> Result<Value, EnrichError> {
        let envelope = self
            .client
            .call(
                DETAIL_API,
                &json!({ "itemId": item_id }),
                ("a21ybx.item.0.0", "a21ybx.search.searchFeedList.0"),
            )
            .await;
        let found = markers(&envelope);
        if found.iter().any(|m| m.contains(BOT_CHALLENGE_MARKER)) {
            return Err(EnrichError::AccountRisk(found.join(" | ")));
        }
        if classify(&found) != MarkerClass::Ok {
            return Err(EnrichError::Transient(found.join(" | ")));
        }
        if lookup(&envelope, path!["data"]).is_none() {
            return Err(EnrichError::Transient("detail envelope without data".into()));
        }
        Ok(envelope)
    }
}

#[async_trait]
impl DetailEnricher for MtopEnricher {
    async fn enrich(&self, task: &Task, listing: &Listing) -> Result<DetailRecord, EnrichError> {
        let item_id = if listing.id.chars().all(|c| c.is_ascii_digit()) && !listing.id.is_empty() {
            listing.id.clone()
        } else {
            item_id_from_link(&listing.link)
                .ok_or_else(|| EnrichError::Transient(format!("no item id in {}", listing.link)))?
        };
        let envelope = self
            .retry
            .run("detail", EnrichError::is_transient, |_| self.fetch_once(&item_id))
            .await?;
        debug!(target = "argus.source", item_id = %item_id, "detail_fetched");
        Ok(build_record(task, listing, &envelope))
    }
}

/// Merges the detail envelope into the search listing.
pub fn build_record(task: &Task, listing: &Listing, envelope: &Value) -> DetailRecord {
    let item = lookup(envelope, path!["data", "itemDO"]).cloned().unwrap_or(Value::Null);
    let seller = lookup(envelope, path!["data", "sellerDO"]).cloned().unwrap_or(Value::Null);

    let mut listing = listing.clone();
    let images: Vec<String> = array(&item, path!["imageInfos"])
        .iter()
        .map(|info| str_or(info, path!["url"], ""))
        .filter(|url| !url.is_empty())
        .map(|url| if url.starts_with("//") { format!("https:{url}") } else { url })
        .collect();
    if !images.is_empty() {
        listing.image_urls = images;
    }
    let wants = str_or(&item, path!["wantCnt"], "");
    if !wants.is_empty() {
        listing.wants = wants;
    }

    let optional = |value: String| (!value.is_empty()).then_some(value);
    let count = |key: &str| {
        let n = i64_or(&seller, path![key], -1);
        (n >= 0).then_some(n)
    };
    let seller_profile = SellerProfile {
        seller_id: optional(str_or(&seller, path!["sellerId"], "")),
        nickname: optional(str_or(&seller, path!["nick"], "")),
        tenure: format_tenure(i64_or(&seller, path!["userRegDay"], 0)),
        zhima_credit: optional(str_or(&seller, path!["zhimaLevelInfo", "levelName"], "")),
        credit_tags: array(&seller, path!["identityTags"])
            .iter()
            .map(|tag| str_or(tag, path!["text"], ""))
            .filter(|text| !text.is_empty())
            .collect(),
        item_count: count("itemCount"),
        rating_count: count("hasSoldNumInteger"),
    };
    if seller.is_null() {
        warn!(target = "argus.source", link = %listing.link, "detail_without_seller");
    }

    DetailRecord {
        capture_time: Utc::now(),
        task_name: task.task_name.clone(),
        keyword: task.keyword.clone(),
        listing,
        seller_profile,
    }
}

const DAYS_PER_YEAR: f64 = 365.25;
const DAYS_PER_MONTH: f64 = DAYS_PER_YEAR / 12.0;

/// Seller tenure from registration days, e.g. `"2 years, 3 months"`.
pub fn format_tenure(days: i64) -> String {
    if days <= 0 {
        return UNKNOWN.into();
    }
    let days = days as f64;
    let mut years = (days / DAYS_PER_YEAR).floor() as i64;
    let mut months = ((days - years as f64 * DAYS_PER_YEAR) / DAYS_PER_MONTH).round() as i64;
    if months == 12 {
        years += 1;
        months = 0;
    }
    let plural = |n: i64, unit: &str| {
        if n == 1 { format!("1 {unit}") } else { format!("{n} {unit}s") }
    };
    match (years, months) {
        (0, 0) => "less than a month".into(),
        (0, m) => plural(m, "month"),
        (y, m) => format!("{}, {}", plural(y, "year"), plural(m, "month")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::SourceConfig, session::Session};
    use reqwest::Client;
    use std::sync::Arc;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path as url_path},
    };

    #[test]
    fn tenure_formatting() {
        assert_eq!(format_tenure(365), "1 year, 0 months");
        assert_eq!(format_tenure(400), "1 year, 1 month");
        assert_eq!(format_tenure(822), "2 years, 3 months");
        assert_eq!(format_tenure(30), "1 month");
        assert_eq!(format_tenure(10), "less than a month");
        assert_eq!(format_tenure(0), "unknown");
        assert_eq!(format_tenure(-5), "unknown");
    }

    fn listing() -> Listing {
        Listing {
            id: "42".into(),
            title: "A7M4".into(),
            price: "¥11000".into(),
            original_price: UNKNOWN.into(),
            wants: "1".into(),
            seller_name: "seller".into(),
            area: UNKNOWN.into(),
            link: "https://www.goofish.com/item?id=42&categoryId=1".into(),
            publish_time: UNKNOWN.into(),
            tags: vec![],
            image_urls: vec!["https://img/a.jpg".into()],
        }
    }

    fn task() -> Task {
        serde_json::from_value(json!({"task_name": "t", "keyword": "a7m4"})).expect("task")
    }

    fn enricher(server: &MockServer, attempts: u32) -> MtopEnricher {
        let config = SourceConfig {
            api_base: format!("{}/h5", server.uri()),
            ..SourceConfig::from_env()
        };
        let client = MtopClient::new(Client::new(), &config, Arc::new(Session::default()));
        MtopEnricher::new(client, RetryPolicy::immediate(attempts))
    }

    #[test]
    fn detail_merges_seller_and_images() {
        let envelope = json!({"ret": ["SUCCESS::ok"], "data": {
            "itemDO": {"imageInfos": [{"url": "//img/1.jpg"}, {"url": ""}, {"url": "https://img/2.jpg"}], "wantCnt": 9},
            "sellerDO": {"sellerId": 77, "nick": "bob", "userRegDay": 400,
                         "zhimaLevelInfo": {"levelName": "信用极好"},
                         "identityTags": [{"text": "实名认证"}], "itemCount": 12}
        }});
        let record = build_record(&task(), &listing(), &envelope);
        assert_eq!(record.listing.image_urls, vec!["https://img/1.jpg", "https://img/2.jpg"]);
        assert_eq!(record.listing.wants, "9");
        assert_eq!(record.seller_profile.seller_id.as_deref(), Some("77"));
        assert_eq!(record.seller_profile.tenure, "1 year, 1 month");
        assert_eq!(record.seller_profile.zhima_credit.as_deref(), Some("信用极好"));
        assert_eq!(record.seller_profile.item_count, Some(12));
        assert_eq!(record.seller_profile.rating_count, None);
    }

    #[tokio::test]
    async fn validation_marker_is_account_risk() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(url_path("/h5/mtop.taobao.idle.pc.detail/1.0/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ret": ["FAIL_SYS_USER_VALIDATE::请验证"], "data": {}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let err = enricher(&server, 3)
            .enrich(&task(), &listing())
            .await
            .err()
            .expect("risk");
        assert!(matches!(err, EnrichError::AccountRisk(_)));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2)
            .mount(&server)
            .await;
        let err = enricher(&server, 2)
            .enrich(&task(), &listing())
            .await
            .err()
            .expect("transient");
        assert!(err.is_transient());
    }
}
