mod common;

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use common::*;
use parse_urls::{
    CacheMode, CacheStore, HarvestReport, ItemOutcome, ParseUrlsError, RejectReason,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

fn with_collaborators(
    config: Value,
    producer: Arc<StaticProducer>,
    collaborators: Collaborators,
) -> parse_urls::Result<ParseUrls> {
    let registry = ProducerRegistry::new().with("static", producer);
    ParseUrls::new(ParseUrlsConfig::from_value(config)?, &registry, collaborators)
}

fn link_urls(report: &HarvestReport) -> Vec<&str> {
    report.links.iter().map(|link| link.url.as_str()).collect()
}

#[tokio::test]
async fn test_end_to_end_run() -> Result<()> {
    init_tracing();

    let producer = StaticProducer::pairs(&[
        ("Show A", "http://index/a"),
        ("Show B", "http://index/b"),
    ]);
    let fetcher = MapFetcher::new()
        .page("http://index/a", "http://files.example.com/a1\nhttp://ads.net/x")
        .page("http://index/b", "http://files.example.com/b1");
    let parse = pipeline(
        json!({
            "inputs": [{ "static": {} }],
            "links_re": ["files\\.example\\.com"],
            "interval": "1 hour"
        }),
        producer,
        Arc::new(MemoryTaskStore::new()),
        Arc::new(fetcher),
    )?;

    let report = parse.run_with_rng(task_at(t0()), seeded_rng()).await?;

    assert_eq!(report.task, TASK);
    assert_eq!(
        link_urls(&report),
        vec!["http://files.example.com/a1", "http://files.example.com/b1"]
    );
    assert_eq!(report.links[0].parent_title, "Show A");
    assert_eq!(report.links[0].index_url, "http://index/a");
    assert_eq!(report.pending().count(), 2);
    assert_eq!(report.rejected().count(), 0);
    assert!(!report.volume_exceeded);
    Ok(())
}

#[tokio::test]
async fn test_each_run_gets_its_own_id() -> Result<()> {
    init_tracing();

    let parse = pipeline(
        json!({ "inputs": [{ "static": {} }] }),
        StaticProducer::pairs(&[]),
        Arc::new(MemoryTaskStore::new()),
        Arc::new(MapFetcher::new()),
    )?;

    let first = parse.run(task_at(t0())).await?;
    let second = parse.run(task_at(t0())).await?;
    assert_ne!(first.run_id, second.run_id);
    assert!(first.items.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unreleased_items_are_held_back() -> Result<()> {
    init_tracing();

    let store = Arc::new(MemoryTaskStore::new());
    let producer = StaticProducer::pairs(&[
        ("Future", "http://index/future"),
        ("Past", "http://index/past"),
        ("Today", "http://index/today"),
        ("Unknown", "http://index/unknown"),
        ("Flaky", "http://index/flaky"),
    ]);
    let fetcher = Arc::new(
        MapFetcher::new()
            .page("http://index/future", "http://dl/future")
            .page("http://index/past", "http://dl/past")
            .page("http://index/today", "http://dl/today")
            .page("http://index/unknown", "http://dl/unknown")
            .page("http://index/flaky", "http://dl/flaky"),
    );
    let release = t0() + Duration::days(1);
    let estimator = FixedEstimator::new()
        .with("Future", ReleaseEstimate::At(release))
        .with("Past", ReleaseEstimate::At(t0() - Duration::days(30)))
        .with(
            "Today",
            ReleaseEstimate::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
        )
        .failing_for("Flaky");

    let parse = with_collaborators(
        json!({ "inputs": [{ "static": {} }], "interval": "1 hour" }),
        producer,
        Collaborators::new(store.clone(), fetcher.clone(), Arc::new(LineExtractor))
            .with_estimator(Arc::new(estimator)),
    )?;

    let report = parse.run_with_rng(task_at(t0()), seeded_rng()).await?;

    assert_eq!(
        report.item("Future").unwrap().outcome,
        ItemOutcome::Rejected(RejectReason::NotYetReleased(release))
    );
    assert_eq!(fetcher.request_count("http://index/future"), 0);
    assert_eq!(
        link_urls(&report),
        vec!["http://dl/past", "http://dl/today", "http://dl/unknown", "http://dl/flaky"]
    );

    // The throttle record is written even though the estimate held it back,
    // but the seen cache is not.
    let mut cache = CacheStore::new(store.clone(), TASK, CacheMode::Replace, Duration::days(7));
    assert!(cache.throttle_record("Future").await?.is_some());
    assert!(!cache.is_seen(0, "Future").await?);
    assert!(cache.is_seen(0, "Past").await?);

    let later = parse
        .run_with_rng(task_at(release + Duration::hours(2)), seeded_rng())
        .await?;
    assert_eq!(link_urls(&later), vec!["http://dl/future"]);
    Ok(())
}

#[tokio::test]
async fn test_ignore_estimations_skips_the_estimate_gate() -> Result<()> {
    init_tracing();

    let producer = StaticProducer::pairs(&[("Future", "http://index/future")]);
    let fetcher = Arc::new(MapFetcher::new().page("http://index/future", "http://dl/future"));
    let estimator =
        FixedEstimator::new().with("Future", ReleaseEstimate::At(t0() + Duration::days(3)));

    let parse = with_collaborators(
        json!({ "inputs": [{ "static": {} }], "ignore_estimations": true }),
        producer,
        Collaborators::new(
            Arc::new(MemoryTaskStore::new()),
            fetcher,
            Arc::new(LineExtractor),
        )
        .with_estimator(Arc::new(estimator)),
    )?;

    let report = parse.run_with_rng(task_at(t0()), seeded_rng()).await?;
    assert_eq!(link_urls(&report), vec!["http://dl/future"]);
    Ok(())
}

#[tokio::test]
async fn test_configuration_errors_fail_setup() -> Result<()> {
    init_tracing();

    let build = |config: Value| {
        pipeline(
            config,
            StaticProducer::pairs(&[]),
            Arc::new(MemoryTaskStore::new()),
            Arc::new(MapFetcher::new()),
        )
    };

    let err = build(json!({ "inputs": [{ "static": {} }], "links_re": ["(unclosed"] })).err();
    assert!(matches!(err, Some(ParseUrlsError::InvalidPattern { .. })));

    let err = build(json!({ "inputs": [{ "nonexistent": {} }] })).err();
    assert!(matches!(err, Some(ParseUrlsError::UnknownProducer(name)) if name == "nonexistent"));

    let err = build(json!({ "inputs": [{ "static": {} }], "interval": "whenever" })).err();
    assert!(matches!(err, Some(ParseUrlsError::InvalidInterval(_))));

    let err = build(json!({ "inputs": [{ "static": {} }], "interval": "20000000 weeks" })).err();
    assert!(matches!(err, Some(ParseUrlsError::InvalidInterval(_))));

    let err = build(json!({
        "inputs": [{ "static": {} }],
        "cache_mode": "union",
        "seen_retention": "20000000 weeks"
    }))
    .err();
    assert!(matches!(err, Some(ParseUrlsError::InvalidInterval(_))));

    let err = build(json!({ "inputs": [{ "static": {} }], "limits": 3 })).err();
    assert!(matches!(err, Some(ParseUrlsError::Configuration(_))));
    Ok(())
}

#[tokio::test]
async fn test_backlog_failure_aborts_before_anything_is_written() -> Result<()> {
    init_tracing();

    let store = Arc::new(MemoryTaskStore::new());
    let producer = StaticProducer::pairs(&[("Show A", "http://index/a")]);
    let fetcher = Arc::new(MapFetcher::new().page("http://index/a", "http://dl/a"));

    let parse = with_collaborators(
        json!({ "inputs": [{ "static": {} }] }),
        producer.clone(),
        Collaborators::new(store.clone(), fetcher.clone(), Arc::new(LineExtractor))
            .with_backlog(Arc::new(BrokenBacklog)),
    )?;

    let err = parse.run_with_rng(task_at(t0()), seeded_rng()).await.unwrap_err();
    assert!(matches!(err, ParseUrlsError::Backlog(_)));
    assert_eq!(producer.calls(), 0);
    assert!(fetcher.requests().is_empty());

    let cache = CacheStore::new(store, TASK, CacheMode::Replace, Duration::days(7));
    assert!(cache.throttle_record("Show A").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_runs_of_one_task_are_serialised() -> Result<()> {
    init_tracing();

    let producer = StaticProducer::pairs(&[("Show A", "http://index/a")]);
    let fetcher = Arc::new(
        MapFetcher::new()
            .page("http://index/a", "http://dl/a")
            .slow("http://index/a", std::time::Duration::from_millis(20)),
    );
    let parse = pipeline(
        json!({ "inputs": [{ "static": {} }] }),
        producer,
        Arc::new(MemoryTaskStore::new()),
        fetcher.clone(),
    )?;

    let (first, second) = tokio::join!(
        parse.run_with_rng(task_at(t0()), seeded_rng()),
        parse.run_with_rng(task_at(t0()), seeded_rng()),
    );
    let produced = first?.links.len() + second?.links.len();

    assert_eq!(produced, 1);
    assert_eq!(fetcher.request_count("http://index/a"), 1);
    Ok(())
}

#[tokio::test]
async fn test_retrying_fetcher_through_collaborators() -> Result<()> {
    init_tracing();

    let producer = StaticProducer::pairs(&[("Show A", "http://index/a")]);
    let fetcher = Arc::new(
        MapFetcher::new()
            .page("http://index/a", "http://dl/a")
            .flaky("http://index/a", 1),
    );

    let parse = with_collaborators(
        json!({ "inputs": [{ "static": {} }] }),
        producer,
        Collaborators::new(
            Arc::new(MemoryTaskStore::new()),
            fetcher.clone(),
            Arc::new(LineExtractor),
        )
        .with_fetch_retries(parse_urls::FetchConfig {
            max_retries: 2,
            retry_delay: std::time::Duration::from_millis(1),
            max_retry_delay: std::time::Duration::from_millis(2),
        }),
    )?;

    let report = parse.run_with_rng(task_at(t0()), seeded_rng()).await?;
    assert_eq!(link_urls(&report), vec!["http://dl/a"]);
    assert_eq!(fetcher.request_count("http://index/a"), 2);
    Ok(())
}

#[tokio::test]
async fn test_downstream_outcomes_roll_up_into_items() -> Result<()> {
    init_tracing();

    let producer = StaticProducer::pairs(&[
        ("Show A", "http://index/a"),
        ("Show B", "http://index/b"),
        ("Show C", "http://index/c"),
    ]);
    let fetcher = MapFetcher::new()
        .page("http://index/a", "http://dl/a1\nhttp://dl/a2")
        .page("http://index/b", "http://dl/b1\nhttp://dl/b2")
        .page("http://index/c", "http://dl/c1\nhttp://dl/c2");
    let parse = pipeline(
        json!({ "inputs": [{ "static": {} }] }),
        producer,
        Arc::new(MemoryTaskStore::new()),
        Arc::new(fetcher),
    )?;
    let mut report = parse.run_with_rng(task_at(t0()), seeded_rng()).await?;

    let duplicate = || ItemOutcome::Rejected(RejectReason::Downstream("duplicate".to_string()));
    let outcomes: HashMap<String, ItemOutcome> = [
        ("http://dl/a1", duplicate()),
        ("http://dl/a2", ItemOutcome::Accepted),
        ("http://dl/b1", duplicate()),
        ("http://dl/b2", ItemOutcome::Rejected(RejectReason::Downstream("too big".to_string()))),
        ("http://dl/c1", duplicate()),
    ]
    .into_iter()
    .map(|(url, outcome)| (url.to_string(), outcome))
    .collect();
    report.apply_link_outcomes(&outcomes);

    assert_eq!(report.item("Show A").unwrap().outcome, ItemOutcome::Accepted);
    assert_eq!(report.item("Show B").unwrap().outcome, duplicate());
    assert!(report.item("Show C").unwrap().outcome.is_pending());
    Ok(())
}

#[tokio::test]
async fn test_large_batches_run_and_flag_the_volume() -> Result<()> {
    init_tracing();

    let candidates: Vec<CandidateItem> = (0..520)
        .map(|n| CandidateItem::new(format!("Show {}", n), format!("http://index/{}", n)))
        .collect();
    let parse = pipeline(
        json!({ "inputs": [{ "static": {} }], "concurrency": 16 }),
        StaticProducer::new(candidates),
        Arc::new(MemoryTaskStore::new()),
        Arc::new(MapFetcher::new()),
    )?;

    let report = parse.run_with_rng(task_at(t0()), seeded_rng()).await?;
    assert!(report.volume_exceeded);
    assert_eq!(report.items.len(), 520);
    assert!(report
        .items
        .iter()
        .all(|item| item.outcome == ItemOutcome::Rejected(RejectReason::FetchFailed)));
    Ok(())
}
