//! Replication planner.
//!
//! Given a stream's declared method and its bookmark (possibly absent),
//! resolves which engine to invoke and applies pre-sync adjustments to the
//! bookmark: resume-or-restart for full passes, replication-key
//! invalidation on key changes, and the method-transition policy. A method
//! switch keeps `version` and `initial_full_table_complete` but drops the
//! old method's bookmark fields, so switches open a fresh incremental or
//! log-based window without forcing a new full extraction.

use crate::catalog::{ReplicationMethod, Stream};
use crate::error::{classify, TapError};
use crate::source::{Clock, SourceConnector};
use crate::state::{Bookmark, BookmarkDetail};
use tracing::{debug, info};

/// The engine to invoke for one stream in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStrategy {
    /// New or resumed pass over the whole table.
    FullTable,
    /// Key-ordered reads strictly above the bookmarked value.
    Incremental { key: String },
    /// Change-tracking reads; the engine runs the initial snapshot itself
    /// when the bookmark has not completed one.
    LogBased,
}

#[derive(Debug)]
pub struct Plan {
    pub strategy: SyncStrategy,
    pub bookmark: Bookmark,
}

/// Resolve the effective strategy and adjusted bookmark for one stream.
pub async fn plan_stream(
    source: &dyn SourceConnector,
    clock: &dyn Clock,
    stream: &Stream,
    prior: Option<&Bookmark>,
) -> Result<Plan, TapError> {
    stream.validate()?;

    let method = stream.replication_method;
    let mut bookmark = match prior {
        Some(prior) => apply_transition(stream, prior.clone()),
        None => Bookmark::new(clock.now().timestamp_millis(), method),
    };
    bookmark.last_replication_method = Some(method);

    let strategy = match method {
        ReplicationMethod::FullTable => {
            if bookmark.mid_full_pass() {
                debug!(stream = %stream.id, version = bookmark.version, "resuming interrupted full pass");
            } else if bookmark.initial_full_table_complete {
                // Prior pass finished; FULL_TABLE re-extracts every run
                // under a new generation.
                bookmark.version = clock.now().timestamp_millis();
                bookmark.initial_full_table_complete = false;
                bookmark.detail = BookmarkDetail::empty(method);
                debug!(stream = %stream.id, version = bookmark.version, "starting new full pass");
            }
            SyncStrategy::FullTable
        }

        ReplicationMethod::Incremental => {
            // validate() guarantees the key is present.
            let key = stream.replication_key.clone().ok_or_else(|| {
                TapError::Configuration {
                    stream: stream.id.to_string(),
                    reason: "INCREMENTAL replication requires exactly one replication key".into(),
                }
            })?;
            if let BookmarkDetail::Incremental(inc) = &mut bookmark.detail {
                if inc.replication_key_name.as_deref() != Some(key.as_str()) {
                    if let Some(old) = &inc.replication_key_name {
                        info!(
                            stream = %stream.id,
                            old_key = %old,
                            new_key = %key,
                            "replication key changed; discarding the bookmarked value"
                        );
                    }
                    inc.replication_key_value = None;
                }
                inc.replication_key_name = Some(key.clone());
            }
            SyncStrategy::Incremental { key }
        }

        ReplicationMethod::LogBased => {
            let enabled = source
                .change_tracking_enabled(stream)
                .await
                .map_err(|e| classify(e, &stream.id))?;
            if !enabled {
                return Err(TapError::Configuration {
                    stream: stream.id.to_string(),
                    reason: "LOG_BASED replication requires change tracking to be enabled \
                             for the database and table"
                        .into(),
                });
            }
            SyncStrategy::LogBased
        }
    };

    Ok(Plan { strategy, bookmark })
}

/// Drop the bookmark fields belonging to the prior method when the method
/// changed, keeping the generation and full-pass completion flag.
fn apply_transition(stream: &Stream, mut bookmark: Bookmark) -> Bookmark {
    let method = stream.replication_method;
    let prior_method = bookmark
        .last_replication_method
        .unwrap_or_else(|| bookmark.method());

    if prior_method != method {
        info!(
            stream = %stream.id,
            from = %prior_method,
            to = %method,
            "replication method changed; dropping bookmark fields of the previous method"
        );
        bookmark.detail = BookmarkDetail::empty(method);
    } else if bookmark.method() != method {
        // Detail disagrees with the recorded method; trust the record and
        // start the new method's window fresh.
        bookmark.detail = BookmarkDetail::empty(method);
    }

    bookmark
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FullTableBookmark, IncrementalBookmark};
    use crate::testing::{test_stream, FixedClock, FixtureSource};
    use serde_json::json;

    fn clock_at(millis: i64) -> FixedClock {
        FixedClock::from_millis(millis)
    }

    #[tokio::test]
    async fn fresh_full_table_stream_gets_a_new_version() {
        let stream = test_stream(ReplicationMethod::FullTable);
        let source = FixtureSource::default();
        let plan = plan_stream(&source, &clock_at(1000), &stream, None)
            .await
            .unwrap();
        assert_eq!(plan.strategy, SyncStrategy::FullTable);
        assert_eq!(plan.bookmark.version, 1000);
        assert!(!plan.bookmark.initial_full_table_complete);
    }

    #[tokio::test]
    async fn interrupted_full_pass_resumes_under_the_same_version() {
        let stream = test_stream(ReplicationMethod::FullTable);
        let source = FixtureSource::default();

        let mut prior = Bookmark::new(500, ReplicationMethod::FullTable);
        prior.last_replication_method = Some(ReplicationMethod::FullTable);
        prior.detail = BookmarkDetail::FullTable(FullTableBookmark {
            last_pk_fetched: Some(vec![json!(10)]),
            max_pk_values: Some(vec![json!(99)]),
        });

        let plan = plan_stream(&source, &clock_at(9999), &stream, Some(&prior))
            .await
            .unwrap();
        assert_eq!(plan.bookmark.version, 500);
        assert!(plan.bookmark.mid_full_pass());
    }

    #[tokio::test]
    async fn completed_full_pass_restarts_under_a_new_version() {
        let stream = test_stream(ReplicationMethod::FullTable);
        let source = FixtureSource::default();

        let mut prior = Bookmark::new(500, ReplicationMethod::FullTable);
        prior.last_replication_method = Some(ReplicationMethod::FullTable);
        prior.initial_full_table_complete = true;

        let plan = plan_stream(&source, &clock_at(9999), &stream, Some(&prior))
            .await
            .unwrap();
        assert_eq!(plan.bookmark.version, 9999);
        assert!(!plan.bookmark.initial_full_table_complete);
    }

    #[tokio::test]
    async fn method_switch_keeps_version_and_completion() {
        let mut stream = test_stream(ReplicationMethod::Incremental);
        stream.replication_key = Some("updated_at".to_string());
        let source = FixtureSource::default();

        let mut prior = Bookmark::new(500, ReplicationMethod::FullTable);
        prior.last_replication_method = Some(ReplicationMethod::FullTable);
        prior.initial_full_table_complete = true;

        let plan = plan_stream(&source, &clock_at(9999), &stream, Some(&prior))
            .await
            .unwrap();
        assert_eq!(plan.bookmark.version, 500);
        assert!(plan.bookmark.initial_full_table_complete);
        assert!(matches!(
            plan.bookmark.detail,
            BookmarkDetail::Incremental(_)
        ));
    }

    #[tokio::test]
    async fn replication_key_rename_discards_the_bookmarked_value() {
        let mut stream = test_stream(ReplicationMethod::Incremental);
        stream.replication_key = Some("updated_at".to_string());
        let source = FixtureSource::default();

        let mut prior = Bookmark::new(500, ReplicationMethod::Incremental);
        prior.last_replication_method = Some(ReplicationMethod::Incremental);
        prior.detail = BookmarkDetail::Incremental(IncrementalBookmark {
            replication_key_name: Some("modified_at".to_string()),
            replication_key_value: Some(json!("2024-01-01T00:00:00Z")),
        });

        let plan = plan_stream(&source, &clock_at(9999), &stream, Some(&prior))
            .await
            .unwrap();
        let BookmarkDetail::Incremental(inc) = &plan.bookmark.detail else {
            panic!("expected incremental detail");
        };
        assert_eq!(inc.replication_key_name.as_deref(), Some("updated_at"));
        assert!(inc.replication_key_value.is_none());
    }

    #[tokio::test]
    async fn log_based_without_tracking_is_a_configuration_error() {
        let stream = test_stream(ReplicationMethod::LogBased);
        let mut source = FixtureSource::default();
        // Table exists but tracking was never enabled on it.
        source.table_mut(&stream.id).change_tracking = false;

        let err = plan_stream(&source, &clock_at(1), &stream, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TapError::Configuration { .. }));
    }
}
