//! `flagwire` is a feature-flag and experimentation evaluation engine. It fetches rule-based
//! flag configurations from a remote service, caches them locally, and evaluates which variant a
//! given user falls into — in-process against the cached rule set, or remotely with one API call
//! per request.
//!
//! # Overview
//!
//! The crate is organized as a set of building blocks assembled by
//! [`LocalEvaluationClient`](client::LocalEvaluationClient).
//!
//! [`FlagConfigCache`](flag_store::FlagConfigCache) is the heart of local evaluation: a
//! thread-safe in-memory map of the currently active flag configurations. Individual flag
//! configurations are immutable and replaced wholesale per sync cycle; readers get a *snapshot*
//! unaffected by later writes, so an evaluation sees one consistent configuration throughout.
//!
//! [`CohortStorage`](cohort::CohortStorage) holds the server-computed membership sets referenced
//! by targeting rules, and answers "which of these candidate cohorts contain this user" during
//! evaluation.
//!
//! [`FlagConfigUpdater`](updater::FlagConfigUpdater) is the consistency core: given a freshly
//! fetched flag configuration set, it downloads first-seen cohorts before committing the flags,
//! refreshes known cohorts best-effort afterwards, and garbage-collects cohorts that are no
//! longer referenced. Updates are serialized internally, so poll-driven and stream-driven
//! commits never interleave.
//!
//! [`FlagConfigPoller`](poller::FlagConfigPoller) keeps the cache fresh by polling.
//! [`FlagConfigStreamer`](streamer::FlagConfigStreamer) keeps it fresh over a push connection,
//! falling back to the poller whenever the stream is down and handing authority back once a
//! reconnect succeeds.
//!
//! [`Evaluator`](evaluator::Evaluator) resolves cohort memberships for a user and delegates to
//! the injected [`EvaluationEngine`](evaluator::EvaluationEngine) — the rule-evaluation
//! algorithm itself is an external collaborator.
//!
//! [`RemoteEvaluationClient`](remote::RemoteEvaluationClient) evaluates server-side instead,
//! and [`AssignmentFilter`](deduplicator::AssignmentFilter) deduplicates what gets forwarded to
//! an analytics client.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use flagwire::client::LocalEvaluationClient;
//! # use flagwire::config::LocalEvaluationConfig;
//! # use flagwire::ExperimentUser;
//! # async fn run(engine: Arc<dyn flagwire::evaluator::EvaluationEngine>) -> flagwire::Result<()> {
//! let client = LocalEvaluationClient::new(
//!     "api-key",
//!     LocalEvaluationConfig::new().with_stream_updates(true),
//!     engine,
//! );
//! client.start().await?;
//!
//! let variants = client.evaluate(&ExperimentUser::from_user_id("user-id"), None);
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

pub mod backoff;
pub mod cache;
pub mod client;
pub mod cohort;
pub mod config;
pub mod deduplicator;
pub mod evaluator;
pub mod executor;
pub mod fetcher;
pub mod flag_store;
pub mod poller;
pub mod remote;
pub mod streamer;
pub mod updater;

mod error;
mod flag;

pub use error::{Error, Result};
pub use flag::{
    all_cohort_ids, all_cohort_ids_by_group, Condition, ExperimentUser, FlagConfig, Segment,
    Variant, USER_GROUP_TYPE,
};
