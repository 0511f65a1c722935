//! Push-based flag configuration updates with automatic fallback to polling.
//!
//! The streamer keeps a long-lived server-sent-event connection that delivers full flag
//! configuration snapshots as they change. When the connection cannot be established or fails
//! mid-stream, the poller takes over as the source of truth, and the streamer keeps retrying the
//! connection in the background. The poller is only stopped once a reconnect actually succeeds,
//! so there is no coverage gap while the stream is down.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL};
use reqwest::{StatusCode, Url};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::flag::FlagConfig;
use crate::poller::FlagConfigPoller;
use crate::updater::FlagConfigUpdater;
use crate::{Error, Result};

const STREAM_ENDPOINT: &str = "/sdk/stream/v1/flags";

/// One message received over the streaming connection.
#[derive(Debug)]
pub enum StreamEvent {
    /// A full flag configuration snapshot, keyed by flag key.
    Flags(HashMap<String, FlagConfig>),
    /// A keep-alive heartbeat carrying no data.
    KeepAlive,
}

/// A live stream of flag configuration messages.
pub type FlagStream = BoxStream<'static, Result<StreamEvent>>;

/// Transport for the streaming connection. Implemented over HTTP server-sent events by
/// [`SseStreamApi`]; tests substitute scripted implementations.
#[async_trait]
pub trait StreamApi: Send + Sync {
    /// Open a connection. The first [`StreamEvent::Flags`] message is the initial snapshot.
    async fn connect(&self) -> Result<FlagStream>;
}

pub struct SseStreamApiConfig {
    pub stream_server_url: String,
    pub api_key: String,
}

/// Server-sent-event implementation of [`StreamApi`].
pub struct SseStreamApi {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    config: SseStreamApiConfig,
}

impl SseStreamApi {
    pub fn new(config: SseStreamApiConfig) -> SseStreamApi {
        SseStreamApi {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl StreamApi for SseStreamApi {
    async fn connect(&self) -> Result<FlagStream> {
        let url = Url::parse(&format!(
            "{}{}",
            self.config.stream_server_url, STREAM_ENDPOINT
        ))?;

        log::debug!(target: "flagwire", "opening flag configuration stream");
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Api-Key {}", self.config.api_key))
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized);
        }
        if !status.is_success() {
            return Err(Error::RequestFailed {
                status: status.as_u16(),
            });
        }

        let mut parser = SseParser::default();
        let stream = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => parser
                    .feed(&String::from_utf8_lossy(&bytes))
                    .into_iter()
                    .map(parse_message)
                    .collect::<Vec<_>>(),
                Err(err) => vec![Err(Error::from(err))],
            })
            .flat_map(futures::stream::iter)
            .boxed();
        Ok(stream)
    }
}

/// Parse one SSE data payload. A blank/whitespace payload is a keep-alive heartbeat; anything
/// else must be a JSON array of flag configurations.
fn parse_message(data: String) -> Result<StreamEvent> {
    if data.trim().is_empty() {
        return Ok(StreamEvent::KeepAlive);
    }
    let flags: Vec<FlagConfig> = serde_json::from_str(&data)?;
    Ok(StreamEvent::Flags(
        flags
            .into_iter()
            .map(|flag| (flag.key.clone(), flag))
            .collect(),
    ))
}

/// Incremental server-sent-event parser. Accumulates `data:` lines and emits the joined payload
/// when a blank line terminates the message. Other SSE fields and comments are ignored.
#[derive(Default)]
struct SseParser {
    line_buffer: String,
    data: Vec<String>,
    in_message: bool,
}

impl SseParser {
    /// Feed a chunk of the response body; returns the payloads of any completed messages.
    fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.line_buffer.push_str(chunk);
        let mut messages = Vec::new();
        while let Some(pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if self.in_message {
                    messages.push(self.data.join("\n"));
                    self.data.clear();
                    self.in_message = false;
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.in_message = true;
                self.data
                    .push(rest.strip_prefix(' ').unwrap_or(rest).to_owned());
            }
        }
        messages
    }
}

/// Configuration for [`FlagConfigStreamer`].
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Timeout for establishing a connection and receiving the initial snapshot.
    pub conn_timeout: Duration,
    /// Number of connection attempts `start()` makes before falling back to polling.
    pub conn_attempts: u32,
    /// Delay between `start()` connection attempts.
    pub conn_retry_delay: Duration,
    /// Interval between reconnect attempts while polling as a fallback.
    pub retry_delay: Duration,
    /// Maximum silence on an established stream before it is treated as failed. The server emits
    /// periodic keep-alive heartbeats well within this window.
    pub keepalive_timeout: Duration,
}

impl Default for StreamerConfig {
    fn default() -> StreamerConfig {
        StreamerConfig {
            conn_timeout: Duration::from_millis(1500),
            conn_attempts: 2,
            conn_retry_delay: Duration::from_secs(1),
            retry_delay: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamerMode {
    Idle,
    /// `start()` is attempting the initial connection.
    Connecting,
    /// The stream is the source of truth.
    Streaming,
    /// The poller is the source of truth; a retry timer attempts to reconnect the stream.
    PollingFallback,
}

struct StreamerState {
    mode: StreamerMode,
    reader: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl Default for StreamerState {
    fn default() -> StreamerState {
        StreamerState {
            mode: StreamerMode::Idle,
            reader: None,
            retry: None,
        }
    }
}

struct StreamerInner {
    api: Arc<dyn StreamApi>,
    updater: Arc<FlagConfigUpdater>,
    poller: Arc<FlagConfigPoller>,
    config: StreamerConfig,
    state: Mutex<StreamerState>,
}

/// Streams flag configuration snapshots, falling back to the poller when the connection fails.
///
/// The initial `start()` makes a bounded number of connection attempts before giving up to
/// polling; a steady-state disconnect falls back to polling immediately. In both cases a retry
/// timer keeps attempting to reconnect, and the poller keeps running until a reconnect succeeds.
pub struct FlagConfigStreamer {
    inner: Arc<StreamerInner>,
}

impl FlagConfigStreamer {
    pub fn new(
        api: Arc<dyn StreamApi>,
        updater: Arc<FlagConfigUpdater>,
        poller: Arc<FlagConfigPoller>,
        config: StreamerConfig,
    ) -> FlagConfigStreamer {
        FlagConfigStreamer {
            inner: Arc::new(StreamerInner {
                api,
                updater,
                poller,
                config,
                state: Mutex::new(StreamerState::default()),
            }),
        }
    }

    /// Start receiving updates. Returns once an initial flag configuration has been committed,
    /// from the stream or from the fallback poller. Calling `start()` while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            match state.mode {
                StreamerMode::Idle => state.mode = StreamerMode::Connecting,
                _ => return Ok(()),
            }
        }

        let inner = &self.inner;
        let attempts = inner.config.conn_attempts.max(1);
        let mut attempt = 0;
        loop {
            match StreamerInner::open(&inner.api, inner.config.conn_timeout).await {
                Ok((initial, stream)) => {
                    if let Err(err) = inner.updater.update(initial).await {
                        inner.set_idle();
                        return Err(err);
                    }
                    let mut state = inner.lock_state();
                    if state.mode != StreamerMode::Connecting {
                        // stop() raced with start(); drop the connection.
                        return Ok(());
                    }
                    state.mode = StreamerMode::Streaming;
                    state.reader =
                        Some(tokio::spawn(StreamerInner::run_reader(Arc::clone(inner), stream)));
                    log::debug!(target: "flagwire", "flag configuration stream connected");
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    // A fatal connection error (e.g. bad credentials) skips the remaining
                    // attempts; transient failures use them up first.
                    if attempt >= attempts || !err.is_retriable() {
                        log::warn!(
                            target: "flagwire",
                            "stream connection failed after {attempt} attempts, falling back to polling: {err}",
                        );
                        break;
                    }
                    log::debug!(
                        target: "flagwire",
                        "stream connection attempt {attempt} failed, retrying: {err}",
                    );
                    tokio::time::sleep(inner.config.conn_retry_delay).await;
                    if inner.mode() != StreamerMode::Connecting {
                        return Ok(());
                    }
                }
            }
        }

        // The fallback poller performs its own awaited initial fetch.
        if let Err(err) = inner.poller.start().await {
            inner.set_idle();
            return Err(err);
        }
        let mut state = inner.lock_state();
        if state.mode != StreamerMode::Connecting {
            inner.poller.stop();
            return Ok(());
        }
        state.mode = StreamerMode::PollingFallback;
        state.retry = Some(tokio::spawn(StreamerInner::run_retry(Arc::clone(inner))));
        Ok(())
    }

    /// Stop streaming, the retry timer, and the fallback poller. Safe to call from any state,
    /// idempotent. In-flight work is aborted at its next await point.
    pub fn stop(&self) {
        let (reader, retry) = {
            let mut state = self.inner.lock_state();
            state.mode = StreamerMode::Idle;
            (state.reader.take(), state.retry.take())
        };
        if let Some(task) = reader {
            task.abort();
        }
        if let Some(task) = retry {
            task.abort();
        }
        self.inner.poller.stop();
    }
}

impl StreamerInner {
    /// Connect and wait for the initial snapshot, both within `conn_timeout`.
    async fn open(
        api: &Arc<dyn StreamApi>,
        conn_timeout: Duration,
    ) -> Result<(HashMap<String, FlagConfig>, FlagStream)> {
        let connect = async {
            let mut stream = api.connect().await?;
            loop {
                match stream.next().await {
                    Some(Ok(StreamEvent::Flags(flags))) => return Ok((flags, stream)),
                    Some(Ok(StreamEvent::KeepAlive)) => continue,
                    Some(Err(err)) => return Err(err),
                    None => {
                        return Err(Error::Stream(
                            "connection closed before initial configuration".to_owned(),
                        ))
                    }
                }
            }
        };
        timeout(conn_timeout, connect)
            .await
            .map_err(|_| Error::StreamTimeout)?
    }

    /// Consume stream messages, committing each snapshot. Any failure, end-of-stream, or
    /// keep-alive silence beyond the timeout ends the task and falls back to polling.
    async fn run_reader(inner: Arc<StreamerInner>, mut stream: FlagStream) {
        loop {
            match timeout(inner.config.keepalive_timeout, stream.next()).await {
                Ok(Some(Ok(StreamEvent::Flags(flags)))) => {
                    if let Err(err) = inner.updater.update(flags).await {
                        log::warn!(target: "flagwire", "failed to commit streamed flag configurations: {err}");
                    }
                }
                Ok(Some(Ok(StreamEvent::KeepAlive))) => {}
                Ok(Some(Err(err))) => {
                    log::warn!(target: "flagwire", "stream failed: {err}");
                    break;
                }
                Ok(None) => {
                    log::warn!(target: "flagwire", "stream closed by server");
                    break;
                }
                Err(_) => {
                    log::warn!(target: "flagwire", "stream keep-alive timed out");
                    break;
                }
            }
        }
        StreamerInner::fall_back(inner).await;
    }

    /// Steady-state stream failure: start the poller immediately and arm the retry timer.
    async fn fall_back(inner: Arc<StreamerInner>) {
        {
            let mut state = inner.lock_state();
            if state.mode != StreamerMode::Streaming {
                return;
            }
            state.mode = StreamerMode::PollingFallback;
            // This task is the reader; it is about to finish.
            state.reader = None;
        }

        log::warn!(target: "flagwire", "falling back to polling until the stream reconnects");
        if let Err(err) = inner.poller.start().await {
            // The retry timer below keeps trying both the stream and the poller.
            log::warn!(target: "flagwire", "fallback poller failed its initial fetch: {err}");
        }

        let mut state = inner.lock_state();
        if state.mode != StreamerMode::PollingFallback {
            inner.poller.stop();
            return;
        }
        state.retry = Some(tokio::spawn(StreamerInner::run_retry(Arc::clone(&inner))));
    }

    /// Periodically attempt to reconnect the stream. The poller keeps running until a reconnect
    /// actually succeeds.
    fn run_retry(inner: Arc<StreamerInner>) -> BoxFuture<'static, ()> {
        // Boxed to break the run_retry -> run_reader -> fall_back -> run_retry future cycle.
        async move {
            loop {
                tokio::time::sleep(inner.config.retry_delay).await;
                if inner.mode() != StreamerMode::PollingFallback {
                    return;
                }
                log::debug!(target: "flagwire", "attempting to reconnect flag configuration stream");
                match StreamerInner::open(&inner.api, inner.config.conn_timeout).await {
                    Ok((initial, stream)) => {
                        if let Err(err) = inner.updater.update(initial).await {
                            log::warn!(target: "flagwire", "failed to commit reconnect snapshot: {err}");
                            continue;
                        }
                        {
                            let mut state = inner.lock_state();
                            if state.mode != StreamerMode::PollingFallback {
                                return;
                            }
                            state.mode = StreamerMode::Streaming;
                            // This task is the retry timer; it is about to finish.
                            state.retry = None;
                            state.reader = Some(tokio::spawn(StreamerInner::run_reader(
                                Arc::clone(&inner),
                                stream,
                            )));
                        }
                        // Stop the poller only now that the stream took over.
                        inner.poller.stop();
                        log::debug!(target: "flagwire", "stream reconnected, poller stopped");
                        return;
                    }
                    Err(err) => {
                        log::debug!(target: "flagwire", "stream reconnect failed, continuing to poll: {err}");
                        // Restore polling coverage if the fallback poller never got through its
                        // initial fetch.
                        if let Err(err) = inner.poller.start().await {
                            log::debug!(target: "flagwire", "fallback poller still failing: {err}");
                        }
                    }
                }
            }
        }
        .boxed()
    }

    fn mode(&self) -> StreamerMode {
        self.lock_state().mode
    }

    fn set_idle(&self) {
        self.lock_state().mode = StreamerMode::Idle;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StreamerState> {
        self.state
            .lock()
            .expect("thread holding streamer state lock should not panic")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    use futures::channel::mpsc;
    use futures::stream;

    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::cohort::CohortStorage;
    use crate::flag::test_flags::plain_flag;
    use crate::flag_store::FlagConfigCache;
    use crate::poller::test_sources::ScriptedSource;
    use crate::poller::PollerConfig;

    fn flags(keys: &[&str]) -> HashMap<String, FlagConfig> {
        keys.iter()
            .map(|key| ((*key).to_owned(), plain_flag(key)))
            .collect()
    }

    /// Scripted stream API: replays the configured connection outcomes in order; further
    /// connects fail.
    struct ScriptedStreamApi {
        connects: AtomicU32,
        outcomes: StdMutex<VecDeque<Result<FlagStream>>>,
    }

    impl ScriptedStreamApi {
        fn returning(outcomes: Vec<Result<FlagStream>>) -> ScriptedStreamApi {
            ScriptedStreamApi {
                connects: AtomicU32::new(0),
                outcomes: StdMutex::new(outcomes.into()),
            }
        }

        fn connects(&self) -> u32 {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StreamApi for ScriptedStreamApi {
        async fn connect(&self) -> Result<FlagStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Stream("no more scripted connections".to_owned())))
        }
    }

    /// A stream that yields the given snapshots and then stays silent.
    fn quiet_stream(snapshots: Vec<HashMap<String, FlagConfig>>) -> FlagStream {
        stream::iter(
            snapshots
                .into_iter()
                .map(|flags| Ok(StreamEvent::Flags(flags)))
                .collect::<Vec<_>>(),
        )
        .chain(stream::pending())
        .boxed()
    }

    /// A stream that yields the given snapshots and then closes.
    fn closing_stream(snapshots: Vec<HashMap<String, FlagConfig>>) -> FlagStream {
        stream::iter(
            snapshots
                .into_iter()
                .map(|flags| Ok(StreamEvent::Flags(flags)))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    struct Fixture {
        streamer: FlagConfigStreamer,
        flag_cache: Arc<FlagConfigCache>,
        source: Arc<ScriptedSource>,
        api: Arc<ScriptedStreamApi>,
    }

    fn fixture(
        stream_outcomes: Vec<Result<FlagStream>>,
        poll_responses: Vec<Result<HashMap<String, FlagConfig>>>,
        config: StreamerConfig,
    ) -> Fixture {
        let flag_cache = Arc::new(FlagConfigCache::new());
        let updater = Arc::new(FlagConfigUpdater::new(
            Arc::clone(&flag_cache),
            Arc::new(CohortStorage::new()),
            None,
        ));
        let source = Arc::new(ScriptedSource::returning(poll_responses));
        let poller = Arc::new(FlagConfigPoller::new(
            Arc::clone(&source) as _,
            Arc::clone(&updater),
            PollerConfig {
                interval: Duration::from_secs(3600),
                jitter: Duration::ZERO,
                backoff: BackoffPolicy {
                    attempts: 1,
                    min: Duration::from_millis(1),
                    max: Duration::from_millis(1),
                    scalar: 1.0,
                },
            },
        ));
        let api = Arc::new(ScriptedStreamApi::returning(stream_outcomes));
        let streamer =
            FlagConfigStreamer::new(Arc::clone(&api) as _, updater, poller, config);
        Fixture {
            streamer,
            flag_cache,
            source,
            api,
        }
    }

    fn quick_config() -> StreamerConfig {
        StreamerConfig {
            conn_timeout: Duration::from_millis(100),
            conn_attempts: 2,
            conn_retry_delay: Duration::from_millis(10),
            retry_delay: Duration::from_millis(30),
            keepalive_timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn commits_initial_and_subsequent_snapshots() {
        let (mut tx, rx) = mpsc::unbounded();
        tx.start_send(Ok(StreamEvent::Flags(flags(&["f1"])))).unwrap();
        let fix = fixture(vec![Ok(rx.boxed())], vec![], quick_config());

        fix.streamer.start().await.unwrap();
        assert!(fix.flag_cache.get("f1").is_some());

        // Subsequent snapshots commit without resolving anything further.
        tx.start_send(Ok(StreamEvent::Flags(flags(&["f2"])))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(fix.flag_cache.get("f1").is_none());
        assert!(fix.flag_cache.get("f2").is_some());
        // The poller never ran.
        assert_eq!(fix.source.calls(), 0);
        fix.streamer.stop();
    }

    #[tokio::test]
    async fn keep_alives_are_not_data() {
        let (mut tx, rx) = mpsc::unbounded();
        tx.start_send(Ok(StreamEvent::KeepAlive)).unwrap();
        tx.start_send(Ok(StreamEvent::Flags(flags(&["f1"])))).unwrap();
        let fix = fixture(vec![Ok(rx.boxed())], vec![], quick_config());

        fix.streamer.start().await.unwrap();

        assert!(fix.flag_cache.get("f1").is_some());
        fix.streamer.stop();
    }

    #[tokio::test]
    async fn falls_back_to_polling_after_connect_attempts() {
        let fix = fixture(
            vec![
                Err(Error::Stream("refused".to_owned())),
                Err(Error::Stream("refused".to_owned())),
            ],
            vec![Ok(flags(&["f1"]))],
            quick_config(),
        );

        fix.streamer.start().await.unwrap();

        // Exactly the configured number of connection attempts were made, then the poller's
        // awaited initial fetch supplied the configuration.
        assert_eq!(fix.api.connects(), 2);
        assert_eq!(fix.source.calls(), 1);
        assert!(fix.flag_cache.get("f1").is_some());
        fix.streamer.stop();
    }

    #[tokio::test]
    async fn reconnect_succeeds_and_stops_poller() {
        let mut config = quick_config();
        config.conn_attempts = 1;
        let fix = fixture(
            vec![
                Err(Error::Stream("refused".to_owned())),
                Ok(quiet_stream(vec![flags(&["f2"])])),
            ],
            vec![Ok(flags(&["f1"]))],
            config,
        );

        fix.streamer.start().await.unwrap();
        assert!(fix.flag_cache.get("f1").is_some());
        let polls_before_reconnect = fix.source.calls();

        // Wait for the retry timer to reconnect.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fix.api.connects(), 2);
        assert!(fix.flag_cache.get("f2").is_some());
        // The poller was stopped after the reconnect; with the long poll interval no further
        // fetches happen.
        assert_eq!(fix.source.calls(), polls_before_reconnect);
        fix.streamer.stop();
    }

    #[tokio::test]
    async fn poller_keeps_running_while_reconnects_fail() {
        let mut config = quick_config();
        config.conn_attempts = 1;
        let fix = fixture(
            // Initial connect fails; all reconnect attempts fail too.
            vec![Err(Error::Stream("refused".to_owned()))],
            vec![Ok(flags(&["f1"]))],
            config,
        );

        fix.streamer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Several reconnects were attempted and the configuration is still served.
        assert!(fix.api.connects() >= 2);
        assert!(fix.flag_cache.get("f1").is_some());
        fix.streamer.stop();
    }

    #[tokio::test]
    async fn steady_state_failure_falls_back_immediately() {
        let mut config = quick_config();
        config.retry_delay = Duration::from_secs(3600);
        let fix = fixture(
            // The stream delivers one snapshot and then closes.
            vec![Ok(closing_stream(vec![flags(&["f1"])]))],
            vec![Ok(flags(&["f2"]))],
            config,
        );

        fix.streamer.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        // The poller took over without waiting for the retry timer.
        assert_eq!(fix.source.calls(), 1);
        assert!(fix.flag_cache.get("f2").is_some());
        fix.streamer.stop();
    }

    #[tokio::test]
    async fn keepalive_silence_is_a_stream_failure() {
        let mut config = quick_config();
        config.keepalive_timeout = Duration::from_millis(30);
        config.retry_delay = Duration::from_secs(3600);
        let fix = fixture(
            // Initial snapshot, then silence beyond the keep-alive timeout.
            vec![Ok(quiet_stream(vec![flags(&["f1"])]))],
            vec![Ok(flags(&["f2"]))],
            config,
        );

        fix.streamer.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(fix.source.calls(), 1);
        assert!(fix.flag_cache.get("f2").is_some());
        fix.streamer.stop();
    }

    #[tokio::test]
    async fn connect_timeout_counts_as_a_failed_attempt() {
        let mut config = quick_config();
        config.conn_timeout = Duration::from_millis(20);
        config.conn_attempts = 1;
        let fix = fixture(
            // Connection opens but never delivers the initial snapshot.
            vec![Ok(stream::pending().boxed())],
            vec![Ok(flags(&["f1"]))],
            config,
        );

        fix.streamer.start().await.unwrap();

        assert!(fix.flag_cache.get("f1").is_some());
        fix.streamer.stop();
    }

    #[tokio::test]
    async fn start_propagates_fallback_poller_failure() {
        let mut config = quick_config();
        config.conn_attempts = 1;
        let fix = fixture(
            vec![Err(Error::Stream("refused".to_owned()))],
            vec![Err(Error::RequestFailed { status: 503 })],
            config,
        );

        let result = fix.streamer.start().await;

        assert!(result.is_err());
        // Back to idle: a later start() goes through the whole sequence again.
        assert_eq!(fix.streamer.inner.mode(), StreamerMode::Idle);
    }

    #[tokio::test]
    async fn stop_is_idempotent_from_any_state() {
        let fix = fixture(
            vec![Ok(quiet_stream(vec![flags(&["f1"])]))],
            vec![],
            quick_config(),
        );

        // stop() before start() is a no-op.
        fix.streamer.stop();

        fix.streamer.start().await.unwrap();
        fix.streamer.stop();
        fix.streamer.stop();

        assert_eq!(fix.streamer.inner.mode(), StreamerMode::Idle);
    }

    #[test]
    fn sse_parser_handles_chunked_messages() {
        let mut parser = SseParser::default();

        assert!(parser.feed("data: [{\"key\"").is_empty());
        assert!(parser.feed(": \"f1\"}]\n").is_empty());
        let messages = parser.feed("\n");

        assert_eq!(messages, vec!["[{\"key\": \"f1\"}]".to_owned()]);
    }

    #[test]
    fn sse_parser_handles_crlf_and_comments() {
        let mut parser = SseParser::default();

        let messages = parser.feed(": comment\r\ndata: []\r\n\r\n");

        assert_eq!(messages, vec!["[]".to_owned()]);
    }

    #[test]
    fn sse_parser_joins_multi_line_data() {
        let mut parser = SseParser::default();

        let messages = parser.feed("data: [\ndata: ]\n\n");

        assert_eq!(messages, vec!["[\n]".to_owned()]);
    }

    #[test]
    fn whitespace_message_is_keep_alive() {
        assert!(matches!(
            parse_message(" ".to_owned()),
            Ok(StreamEvent::KeepAlive)
        ));
        assert!(matches!(
            parse_message(String::new()),
            Ok(StreamEvent::KeepAlive)
        ));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(parse_message("not json".to_owned()).is_err());
    }

    #[test]
    fn snapshot_payload_parses_to_flag_map() {
        let event = parse_message(r#"[{"key": "f1"}, {"key": "f2"}]"#.to_owned()).unwrap();

        match event {
            StreamEvent::Flags(flags) => {
                assert_eq!(flags.len(), 2);
                assert!(flags.contains_key("f1"));
            }
            StreamEvent::KeepAlive => panic!("expected flags"),
        }
    }
}
