//! Downloading cohorts from the server, with request coalescing and retries.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::AUTHORIZATION;
use reqwest::{StatusCode, Url};

use super::Cohort;
use crate::config::CohortSyncConfig;
use crate::{Error, Result};

/// Number of download attempts for transient failures.
const DOWNLOAD_ATTEMPTS: u32 = 3;
/// Fixed delay between download attempts.
const DOWNLOAD_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Outcome of a single cohort download request.
#[derive(Debug, Clone)]
pub enum CohortDownload {
    /// The server returned new cohort data.
    Cohort(Cohort),
    /// The cohort has not changed since the `last_modified` hint.
    NoChange,
}

/// Transport for cohort downloads. Implemented over HTTP by [`DirectCohortDownloadApi`]; tests
/// substitute scripted implementations.
#[async_trait]
pub trait CohortDownloadApi: Send + Sync {
    /// Request the cohort, passing `last_modified` as a conditional-fetch hint when known.
    async fn get_cohort(
        &self,
        cohort_id: &str,
        last_modified: Option<u64>,
    ) -> Result<CohortDownload>;
}

/// HTTP implementation of [`CohortDownloadApi`].
pub struct DirectCohortDownloadApi {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    config: CohortSyncConfig,
}

impl DirectCohortDownloadApi {
    pub fn new(config: CohortSyncConfig) -> DirectCohortDownloadApi {
        DirectCohortDownloadApi {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn cohort_url(&self, cohort_id: &str, last_modified: Option<u64>) -> Result<Url> {
        let mut params = vec![("maxCohortSize", self.config.max_cohort_size.to_string())];
        if let Some(last_modified) = last_modified {
            params.push(("lastModified", last_modified.to_string()));
        }
        let url = Url::parse_with_params(
            &format!(
                "{}/sdk/v1/cohort/{}",
                self.config.cohort_server_url, cohort_id
            ),
            &params,
        )?;
        Ok(url)
    }
}

#[async_trait]
impl CohortDownloadApi for DirectCohortDownloadApi {
    async fn get_cohort(
        &self,
        cohort_id: &str,
        last_modified: Option<u64>,
    ) -> Result<CohortDownload> {
        let url = self.cohort_url(cohort_id, last_modified)?;
        let token = BASE64.encode(format!(
            "{}:{}",
            self.config.api_key, self.config.secret_key
        ));

        log::debug!(target: "flagwire", "downloading cohort {cohort_id}");
        let response = self
            .client
            .get(url)
            .timeout(self.config.request_timeout)
            .header(AUTHORIZATION, format!("Basic {token}"))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let cohort: Cohort = response.json().await?;
                Ok(CohortDownload::Cohort(cohort))
            }
            StatusCode::NO_CONTENT => Ok(CohortDownload::NoChange),
            StatusCode::PAYLOAD_TOO_LARGE => Err(Error::CohortTooLarge {
                cohort_id: cohort_id.to_owned(),
                max_size: self.config.max_cohort_size,
            }),
            status => Err(Error::RequestFailed {
                status: status.as_u16(),
            }),
        }
    }
}

type DownloadResult = Result<Option<Arc<Cohort>>>;
type SharedDownload = Shared<BoxFuture<'static, DownloadResult>>;

/// In-flight request key. Requests for the same cohort with different `last_modified` hints are
/// distinct and do not share a download.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DownloadKey {
    cohort_id: String,
    last_modified: Option<u64>,
}

/// Fetches cohorts, coalescing concurrent requests for the same `(cohort_id, last_modified)` key
/// into one underlying download.
///
/// Transient failures are retried a fixed number of times with a fixed delay; a cohort exceeding
/// the maximum size fails immediately. A failure is delivered to every waiter sharing the
/// in-flight request.
pub struct CohortFetcher {
    api: Arc<dyn CohortDownloadApi>,
    in_flight: Mutex<HashMap<DownloadKey, SharedDownload>>,
}

impl CohortFetcher {
    pub fn new(api: Arc<dyn CohortDownloadApi>) -> CohortFetcher {
        CohortFetcher {
            api,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the cohort. Returns `None` when the server confirms no change since
    /// `last_modified`.
    pub async fn fetch(
        &self,
        cohort_id: &str,
        last_modified: Option<u64>,
    ) -> Result<Option<Arc<Cohort>>> {
        let key = DownloadKey {
            cohort_id: cohort_id.to_owned(),
            last_modified,
        };

        let download = {
            let mut in_flight = self
                .in_flight
                .lock()
                .expect("thread holding in-flight table lock should not panic");
            match in_flight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let api = Arc::clone(&self.api);
                    let cohort_id = key.cohort_id.clone();
                    let download = Self::download_with_retries(api, cohort_id, last_modified)
                        .boxed()
                        .shared();
                    in_flight.insert(key.clone(), download.clone());
                    download
                }
            }
        };

        let result = download.await;

        self.in_flight
            .lock()
            .expect("thread holding in-flight table lock should not panic")
            .remove(&key);

        result
    }

    async fn download_with_retries(
        api: Arc<dyn CohortDownloadApi>,
        cohort_id: String,
        last_modified: Option<u64>,
    ) -> DownloadResult {
        let mut attempt = 0;
        loop {
            match api.get_cohort(&cohort_id, last_modified).await {
                Ok(CohortDownload::Cohort(cohort)) => return Ok(Some(Arc::new(cohort))),
                Ok(CohortDownload::NoChange) => return Ok(None),
                Err(err) => {
                    attempt += 1;
                    if !err.is_retriable() || attempt >= DOWNLOAD_ATTEMPTS {
                        return Err(err);
                    }
                    log::debug!(
                        target: "flagwire",
                        "cohort {cohort_id} download attempt {attempt} failed, retrying: {err}",
                    );
                    tokio::time::sleep(DOWNLOAD_RETRY_DELAY).await;
                }
            }
        }
    }
}
