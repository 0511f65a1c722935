//! An HTTP client that fetches flag configurations from the server.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{StatusCode, Url};

use crate::flag::FlagConfig;
use crate::{Error, Result};

const FLAGS_ENDPOINT: &str = "/sdk/v1/flags";

/// Source of full flag configuration sets. Implemented over HTTP by [`FlagConfigFetcher`]; tests
/// substitute scripted implementations.
#[async_trait]
pub trait FlagConfigSource: Send + Sync {
    /// Fetch the full flag rule set, keyed by flag key.
    async fn fetch(&self) -> Result<HashMap<String, FlagConfig>>;
}

pub struct FlagConfigFetcherConfig {
    pub server_url: String,
    pub api_key: String,
    /// Timeout for a single fetch request.
    pub timeout: Duration,
}

/// A client that fetches the full flag rule set from the server.
///
/// This is a one-shot fetcher: a non-success response is an error and the caller decides the
/// retry policy.
pub struct FlagConfigFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    config: FlagConfigFetcherConfig,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl FlagConfigFetcher {
    pub fn new(config: FlagConfigFetcherConfig) -> FlagConfigFetcher {
        FlagConfigFetcher {
            client: reqwest::Client::new(),
            config,
            unauthorized: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl FlagConfigSource for FlagConfigFetcher {
    async fn fetch(&self) -> Result<HashMap<String, FlagConfig>> {
        if self.unauthorized.load(Ordering::Acquire) {
            return Err(Error::Unauthorized);
        }

        let url = Url::parse(&format!("{}{}", self.config.server_url, FLAGS_ENDPOINT))?;

        log::debug!(target: "flagwire", "fetching flag configurations");
        let response = self
            .client
            .get(url)
            .timeout(self.config.timeout)
            .header(AUTHORIZATION, format!("Api-Key {}", self.config.api_key))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            log::warn!(target: "flagwire", "client is not authorized. Check your API key");
            self.unauthorized.store(true, Ordering::Release);
            return Err(Error::Unauthorized);
        }
        if !status.is_success() {
            log::warn!(target: "flagwire", "received non-200 response while fetching flag configurations: {status}");
            return Err(Error::RequestFailed {
                status: status.as_u16(),
            });
        }

        let flags: Vec<FlagConfig> = response.json().await?;

        log::debug!(target: "flagwire", "successfully fetched {} flag configurations", flags.len());

        Ok(flags
            .into_iter()
            .map(|flag| (flag.key.clone(), flag))
            .collect())
    }
}
