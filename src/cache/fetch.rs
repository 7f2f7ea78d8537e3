//! Fetch executor: one logical fetch with bounded retry.
//!
//! A fetch starts under the cache lock ([`Entry::begin_fetch`]), which
//! writes `Loading` and hands out a [`FetchTicket`]. The ticket is executed
//! outside the lock and its outcome is applied with [`Entry::finish_fetch`],
//! which discards results of superseded generations.
//!
//! [`Entry::begin_fetch`]: super::entry::Entry::begin_fetch
//! [`Entry::finish_fetch`]: super::entry::Entry::finish_fetch

use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use crate::key::EntryId;
use crate::telemetry;
use crate::types::{QueryResult, Request, Response};
use crate::Result;

/// A started fetch, detached from the cache lock.
pub(crate) struct FetchTicket {
    pub(crate) entry: EntryId,
    pub(crate) key: String,
    pub(crate) generation: u64,
    pub(crate) request: Arc<dyn Request>,
    pub(crate) retry_limit: u32,
}

/// Send the ticket's request until it succeeds or the retry budget is spent.
///
/// `retry_limit` counts extra attempts, so 0 means exactly one request.
/// Application-level failures are retried and finally returned as
/// [`QueryResult::Error`]. A transport fault aborts the cycle and is returned
/// as `Err` without retry.
pub(crate) async fn execute(ticket: &FetchTicket) -> Result<QueryResult> {
    let start = Instant::now();
    let mut attempt = 0u32;
    debug!(key = %ticket.key, generation = ticket.generation, "fetch started");

    let result = loop {
        let response = match ticket.request.send().await {
            Ok(response) => response,
            Err(e) => {
                metrics::counter!(telemetry::TRANSPORT_FAULTS_TOTAL).increment(1);
                return Err(e);
            }
        };
        match response {
            Response::Success { .. } => break response.into_result(),
            Response::Failure { .. } if attempt >= ticket.retry_limit => {
                break response.into_result();
            }
            Response::Failure { .. } => {
                attempt += 1;
                metrics::counter!(telemetry::RETRIES_TOTAL).increment(1);
                debug!(
                    key = %ticket.key,
                    attempt,
                    retry_limit = ticket.retry_limit,
                    "retrying after failure response"
                );
            }
        }
    };

    let status = result.status();
    metrics::counter!(telemetry::FETCHES_TOTAL, "status" => status.as_str()).increment(1);
    metrics::histogram!(telemetry::FETCH_DURATION_SECONDS).record(start.elapsed().as_secs_f64());
    debug!(
        key = %ticket.key,
        generation = ticket.generation,
        attempts = attempt + 1,
        %status,
        "fetch finished"
    );
    Ok(result)
}
