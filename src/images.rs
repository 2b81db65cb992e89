use base64::Engine as _;
use futures::future::join_all;
use reqwest::{Client, header};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const ILLEGAL: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Per-task scratch directory for listing images handed to the judge.
pub struct ImageStore {
    http: Client,
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(http: Client, root: &Path, task_name: &str) -> Self {
        Self {
            http,
            dir: root.join(format!("task_images_{}", sanitize(task_name))),
        }
    }

    #[cfg(test)]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Downloads every usable image concurrently; failures are logged and left out.
    pub async fn download_all(&self, listing_id: &str, urls: &[String]) -> Vec<PathBuf> {
        if urls.is_empty() {
            return Vec::new();
        }
        if let Err(err) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(target = "argus.images", dir = %self.dir.display(), error = %err, "image_dir_create_failed");
            return Vec::new();
        }
        let downloads = urls.iter().enumerate().filter_map(|(index, url)| {
            let url = strip_heic(url.trim());
            if !url.starts_with("http") {
                return None;
            }
            let target = self.dir.join(file_name(listing_id, index + 1, url));
            Some(self.fetch(url.to_string(), target))
        });
        join_all(downloads).await.into_iter().flatten().collect()
    }

    async fn fetch(&self, url: String, target: PathBuf) -> Option<PathBuf> {
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            debug!(target = "argus.images", path = %target.display(), "image_already_present");
            return Some(target);
        }
        let response = self
            .http
            .get(&url)
            .header(header::ACCEPT, "image/avif,image/webp,image/apng,image/*,*/*;q=0.8")
            .send()
            .await
            .and_then(|r| r.error_for_status());
        let bytes = match response {
            Ok(response) => response.bytes().await,
            Err(err) => Err(err),
        };
        match bytes {
            Ok(bytes) => match tokio::fs::write(&target, &bytes).await {
                Ok(()) => Some(target),
                Err(err) => {
                    warn!(target = "argus.images", path = %target.display(), error = %err, "image_write_failed");
                    None
                }
            },
            Err(err) => {
                warn!(target = "argus.images", url = %url, error = %err, "image_download_failed");
                None
            }
        }
    }

    pub async fn encode_all(paths: &[PathBuf]) -> Vec<String> {
        let mut encoded = Vec::with_capacity(paths.len());
        for path in paths {
            match tokio::fs::read(path).await {
                Ok(bytes) => encoded.push(data_url(&bytes)),
                Err(err) => {
                    warn!(target = "argus.images", path = %path.display(), error = %err, "image_read_failed")
                }
            }
        }
        encoded
    }

    pub async fn remove(paths: &[PathBuf]) {
        for path in paths {
            if let Err(err) = tokio::fs::remove_file(path).await
                && err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(target = "argus.images", path = %path.display(), error = %err, "image_remove_failed");
            }
        }
    }

    /// Deletes the whole scratch directory at the end of a run.
    pub async fn cleanup(&self) {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => info!(target = "argus.images", dir = %self.dir.display(), "image_dir_removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(target = "argus.images", dir = %self.dir.display(), error = %err, "image_dir_remove_failed")
            }
        }
    }
}

pub fn data_url(bytes: &[u8]) -> String {
    format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

fn strip_heic(url: &str) -> &str {
    url.split_once(".heic").map(|(head, _)| head).unwrap_or(url)
}

fn sanitize(input: &str) -> String {
    input.chars().filter(|c| !ILLEGAL.contains(c)).collect()
}

fn file_name(listing_id: &str, position: usize, url: &str) -> String {
    let base = url::Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|mut s| s.next_back().map(str::to_string)))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "image".into());
    let mut name = sanitize(&format!("product_{listing_id}_{position}_{base}"));
    if Path::new(&name).extension().is_none() {
        name.push_str(".jpg");
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    #[test]
    fn file_names_are_safe() {
        assert_eq!(
            file_name("9", 1, "https://img.example.com/bao/uploaded/i4/photo.jpg"),
            "product_9_1_photo.jpg"
        );
        assert_eq!(file_name("9", 2, "https://img.example.com/raw"), "product_9_2_raw.jpg");
        assert_eq!(strip_heic("https://x/a.heic_460x460.jpg"), "https://x/a");
        assert_eq!(sanitize("a:b?c"), "abc");
    }

    #[test]
    fn data_urls_are_jpeg_base64() {
        assert_eq!(data_url(b"hi"), "data:image/jpeg;base64,aGk=");
    }

    #[tokio::test]
    async fn downloads_concurrently_and_cleans_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"one".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().expect("tempdir");
        let store = ImageStore::new(Client::new(), root.path(), "Sony A7M4");
        let urls = vec![
            format!("{}/a.jpg", server.uri()),
            format!("{}/missing.jpg", server.uri()),
            "ftp://nope/x.jpg".to_string(),
        ];
        let paths = store.download_all("42", &urls).await;
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("product_42_1_a.jpg"));

        let encoded = ImageStore::encode_all(&paths).await;
        assert_eq!(encoded, vec![data_url(b"one")]);

        store.cleanup().await;
        assert!(!store.dir().exists());
    }
}
