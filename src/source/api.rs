use super::{
    HTTP_ERROR_PREFIX, ListingSource, REQUEST_ERROR_PREFIX, SearchPage, SourceError, interpret,
    search_filter,
};
use crate::{
    config::SourceConfig,
    models::Task,
    session::{Session, sign},
};
use async_trait::async_trait;
use reqwest::{Client, header};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

pub const SEARCH_API: &str = "mtop.taobao.idlemtopsearch.pc.search";
pub const DETAIL_API: &str = "mtop.taobao.idle.pc.detail";

/// Signed calls against the marketplace's mtop gateway.
///
/// Never fails: transport problems come back as an envelope whose `ret` holds a
/// synthetic `HTTP_ERROR::<status>` or `REQUEST_ERROR::<message>` marker, so
/// callers classify every outcome the same way.
#[derive(Clone)]
pub struct MtopClient {
    http: Client,
    api_base: String,
    web_base: String,
    app_key: String,
    session: Arc<Session>,
}

impl MtopClient {
    pub fn new(http: Client, config: &SourceConfig, session: Arc<Session>) -> Self {
        Self {
            http,
            api_base: config.api_base.clone(),
            web_base: config.web_base.clone(),
            app_key: config.app_key.clone(),
            session,
        }
    }

    pub async fn call(&self, api: &str, data: &Value, spm: (&str, &str)) -> Value {
        let data_json = data.to_string();
        let timestamp = chrono::Utc::now().timestamp_millis();
        let signature = sign(self.session.token_prefix(), timestamp, &self.app_key, &data_json);
        let url = format!("{}/{api}/1.0/", self.api_base);
        let t = timestamp.to_string();

        let response = self
            .http
            .post(&url)
            .query(&[
                ("jsv", "2.7.2"),
                ("appKey", self.app_key.as_str()),
                ("t", t.as_str()),
                ("sign", signature.as_str()),
                ("v", "1.0"),
                ("type", "originaljson"),
                ("accountSite", "xianyu"),
                ("dataType", "json"),
                ("timeout", "20000"),
                ("api", api),
                ("sessionOption", "AutoLoginOnly"),
                ("spm_cnt", spm.0),
                ("spm_pre", spm.1),
            ])
            .header(header::COOKIE, self.session.cookie_header())
            .header(header::ACCEPT, "application/json")
            .header(header::ORIGIN, self.web_base.as_str())
            .header(header::REFERER, format!("{}/", self.web_base))
            .header(header::ACCEPT_LANGUAGE, "zh-CN,zh;q=0.9")
            .form(&[("data", data_json.as_str())])
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => return synthetic(format!("{REQUEST_ERROR_PREFIX}{err}")),
        };
        let status = response.status();
        if !status.is_success() {
            return synthetic(format!("{HTTP_ERROR_PREFIX}{}", status.as_u16()));
        }
        match response.json::<Value>().await {
            Ok(envelope) => envelope,
            Err(err) => synthetic(format!("{REQUEST_ERROR_PREFIX}invalid json: {err}")),
        }
    }
}

fn synthetic(marker: String) -> Value {
    json!({"ret": [marker], "data": {}})
}

pub fn search_payload(task: &Task, page: u32, page_size: u32) -> Value {
    let mut prop = serde_json::Map::new();
    if let Some(filter) = search_filter(task) {
        prop.insert("searchFilter".into(), Value::String(filter));
    }
    json!({
        "pageNumber": page,
        "keyword": task.keyword,
        "fromFilter": true,
        "rowsPerPage": page_size,
        "sortValue": "desc",
        "sortField": "create",
        "customDistance": "",
        "gps": "",
        "propValueStr": prop,
        "customGps": "",
        "searchReqFromPage": "pcSearch",
        "extraFilterValue": "{}",
        "userPositionJson": "{}"
    })
}

pub struct ApiSource {
    client: MtopClient,
    page_size: u32,
    debug: bool,
}

impl ApiSource {
    pub fn new(client: MtopClient, page_size: u32, debug: bool) -> Self {
        Self {
            client,
            page_size,
            debug,
        }
    }
}

#[async_trait]
impl ListingSource for ApiSource {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn fetch(&self, task: &Task, page: u32) -> Result<SearchPage, SourceError> {
        let payload = search_payload(task, page, self.page_size);
        info!(
            target = "argus.source",
            task = %task.task_name,
            keyword = %task.keyword,
            page,
            "search_request"
        );
        let envelope = self
            .client
            .call(SEARCH_API, &payload, ("a21ybx.search.0.0", "a21ybx.search.searchInput.0"))
            .await;
        if self.debug {
            debug!(target = "argus.source", envelope = %envelope, "search_envelope_raw");
        }
        interpret(&envelope, "api")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::fixtures;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_string_contains, header_exists, method, path, query_param},
    };

    fn task() -> Task {
        serde_json::from_value(json!({
            "task_name": "Sony A7M4",
            "keyword": "A7M4",
            "min_price": "10000",
            "max_price": "13000",
            "personal_only": true
        }))
        .expect("task")
    }

    fn source(server: &MockServer) -> ApiSource {
        let config = SourceConfig {
            api_base: format!("{}/h5", server.uri()),
            ..SourceConfig::from_env()
        };
        let session = Arc::new(Session::from_pairs(&[("_m_h5_tk", "tok_123"), ("cna", "c")]));
        ApiSource::new(MtopClient::new(Client::new(), &config, session), 30, false)
    }

    #[test]
    fn payload_carries_filters() {
        let payload = search_payload(&task(), 2, 30);
        assert_eq!(payload["pageNumber"], 2);
        assert_eq!(
            payload["propValueStr"]["searchFilter"],
            "priceRange:10000,13000;sellerType:1;"
        );
    }

    #[tokio::test]
    async fn signed_search_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/h5/mtop.taobao.idlemtopsearch.pc.search/1.0/"))
            .and(query_param("appKey", "34839810"))
            .and(query_param("api", SEARCH_API))
            .and(header_exists("cookie"))
            .and(body_string_contains("data="))
            .respond_with(ResponseTemplate::new(200).set_body_json(fixtures::envelope(vec![
                fixtures::search_item("1", "A7M4 body", "11000"),
                fixtures::search_item("2", "A7M4 kit", "12500"),
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let page = source(&server).fetch(&task(), 1).await.expect("page");
        assert_eq!(page.listings.len(), 2);
        assert_eq!(page.listings[1].price, "¥12500");
    }

    #[tokio::test]
    async fn http_failure_becomes_transport_marker() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = source(&server).fetch(&task(), 1).await.err().expect("error");
        match err {
            SourceError::Transport(marker) => assert_eq!(marker, "HTTP_ERROR::503"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_marker_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ret": ["RGV587_ERROR::SM::哎哟喂,被挤爆啦,请稍后重试"],
                "data": {}
            })))
            .mount(&server)
            .await;
        let err = source(&server).fetch(&task(), 1).await.err().expect("error");
        assert!(matches!(err, SourceError::RateLimited(_)));
    }
}
