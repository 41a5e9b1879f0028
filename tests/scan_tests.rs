mod common;

use common::{
    controller, crawler, scratch_output, test_config, Behavior, BrokenSource, CountryLookup,
    MockProber, StaticSource,
};
use proxy_finder::config::{GeoPolicy, ScanOverrides};
use proxy_finder::error::ScanError;
use proxy_finder::proxy::{GeoLookup, Scheme, WorkingProxy};
use proxy_finder::scan::{ResultStore, ScanState};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const TARGET: &str = "https://target.example/";

#[tokio::test]
async fn test_failing_provider_does_not_abort_crawl() {
    let crawler = crawler(vec![
        StaticSource::new("first", &[("1.1.1.1", 80), ("2.2.2.2", 8080)]),
        Arc::new(BrokenSource),
        StaticSource::new("third", &[("2.2.2.2", 8080), ("3.3.3.3", 3128)]),
    ]);

    let report = crawler.fetch_candidates(None).await;
    let addresses: Vec<String> = report.candidates.iter().map(|c| c.address()).collect();
    assert_eq!(addresses, vec!["1.1.1.1:80", "2.2.2.2:8080", "3.3.3.3:3128"]);
    assert!(!report.all_failed());
    assert_eq!(report.sources.iter().filter(|s| s.error.is_some()).count(), 1);
}

#[tokio::test]
async fn test_scan_records_each_address_once() {
    let prober = Arc::new(
        MockProber::new(Duration::from_millis(5))
            .all_http_ok(&["1.1.1.1:80", "2.2.2.2:8080"])
            .with("1.1.1.1:80", Scheme::Https, Behavior::Ok),
    );
    let controller = controller(
        test_config(&[TARGET]),
        vec![
            StaticSource::new("a", &[("1.1.1.1", 80), ("2.2.2.2", 8080)]),
            StaticSource::new("b", &[("1.1.1.1", 80), ("4.4.4.4", 80)]),
        ],
        prober.clone(),
        None,
    );

    let run = controller.run_once(ScanOverrides::default()).await.unwrap();
    assert_eq!(run.state, ScanState::Finished);
    assert_eq!(run.candidates, 3);
    assert_eq!(run.probes_planned, 6);
    assert_eq!(run.probes_done, 6);
    assert_eq!(prober.calls.load(Ordering::SeqCst), 6);

    let results = controller.results().await;
    let addresses: Vec<&str> = results.iter().map(|w| w.proxy.as_str()).collect();
    assert_eq!(addresses, vec!["1.1.1.1:80", "2.2.2.2:8080"]);
    let unique: HashSet<&str> = addresses.iter().copied().collect();
    assert_eq!(unique.len(), addresses.len());
}

#[tokio::test]
async fn test_https_fallback_recorded_once() {
    let prober = Arc::new(
        MockProber::new(Duration::from_millis(5))
            .with("5.5.5.5:3128", Scheme::Http, Behavior::Fail)
            .with("5.5.5.5:3128", Scheme::Https, Behavior::Ok),
    );
    let controller = controller(
        test_config(&[TARGET]),
        vec![StaticSource::new("only", &[("5.5.5.5", 3128)])],
        prober,
        None,
    );

    controller.run_once(ScanOverrides::default()).await.unwrap();

    let results = controller.results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].proxy, "5.5.5.5:3128");
    assert_eq!(results[0].scheme, Scheme::Https);
    assert_eq!(results[0].target, TARGET);
}

#[tokio::test]
async fn test_max_per_target_bounds_in_flight_probes() {
    let hosts: Vec<String> = (1..=20).map(|i| format!("10.0.0.{i}")).collect();
    let addresses: Vec<(&str, u16)> = hosts.iter().map(|h| (h.as_str(), 8080)).collect();
    let prober = Arc::new(MockProber::new(Duration::from_millis(20)));

    let config = test_config(&["https://a.example/", "https://b.example/"])
        .with_max_per_target(3)
        .with_max_workers(64);
    let controller = controller(
        config,
        vec![StaticSource::new("many", &addresses)],
        prober.clone(),
        None,
    );

    let run = controller.run_once(ScanOverrides::default()).await.unwrap();
    assert_eq!(run.probes_done, 80);

    for target in ["https://a.example/", "https://b.example/"] {
        let peak = prober.max_in_flight(target);
        assert!(peak >= 1, "{target} never probed");
        assert!(peak <= 3, "{target} had {peak} probes in flight");
    }
}

#[tokio::test]
async fn test_max_workers_bounds_all_targets() {
    let hosts: Vec<String> = (1..=20).map(|i| format!("10.0.1.{i}")).collect();
    let addresses: Vec<(&str, u16)> = hosts.iter().map(|h| (h.as_str(), 8080)).collect();
    let prober = Arc::new(MockProber::new(Duration::from_millis(20)));
    let targets = ["https://a.example/", "https://b.example/", "https://c.example/"];

    let config = test_config(&targets)
        .with_max_per_target(5)
        .with_max_workers(4);
    let controller = controller(
        config,
        vec![StaticSource::new("many", &addresses)],
        prober.clone(),
        None,
    );

    let run = controller.run_once(ScanOverrides::default()).await.unwrap();
    assert_eq!(run.probes_done, run.probes_planned);
    assert_eq!(run.probes_done, 120);

    let peak = prober.max_in_flight_overall();
    assert!(peak >= 1, "nothing was checked");
    assert!(peak <= 4, "{peak} checks in flight across all targets");
    for target in targets {
        assert!(prober.max_in_flight(target) <= 4);
    }
}

#[tokio::test]
async fn test_override_max_per_target() {
    let hosts: Vec<String> = (1..=10).map(|i| format!("10.1.0.{i}")).collect();
    let addresses: Vec<(&str, u16)> = hosts.iter().map(|h| (h.as_str(), 80)).collect();
    let prober = Arc::new(MockProber::new(Duration::from_millis(20)));
    let controller = controller(
        test_config(&[TARGET]).with_max_per_target(8),
        vec![StaticSource::new("many", &addresses)],
        prober.clone(),
        None,
    );

    let overrides = ScanOverrides {
        max_per_target: Some(1),
        ..Default::default()
    };
    let run = controller.run_once(overrides).await.unwrap();
    assert_eq!(run.config.unwrap().max_per_target, 1);
    assert_eq!(prober.max_in_flight(TARGET), 1);
}

#[tokio::test]
async fn test_rerun_yields_identical_results() {
    let prober = Arc::new(
        MockProber::new(Duration::from_millis(2))
            .all_http_ok(&["1.1.1.1:80", "3.3.3.3:80"])
            .with("2.2.2.2:80", Scheme::Https, Behavior::Ok)
            .with("4.4.4.4:80", Scheme::Http, Behavior::Timeout),
    );
    let controller = controller(
        test_config(&["https://a.example/", "https://b.example/"]),
        vec![StaticSource::new(
            "fixed",
            &[("1.1.1.1", 80), ("2.2.2.2", 80), ("3.3.3.3", 80), ("4.4.4.4", 80)],
        )],
        prober,
        None,
    );

    controller.run_once(ScanOverrides::default()).await.unwrap();
    let first = controller.results().await;
    controller.run_once(ScanOverrides::default()).await.unwrap();
    let second = controller.results().await;

    assert_eq!(first.len(), 6);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_start_while_running_is_rejected() {
    let prober = Arc::new(MockProber::new(Duration::from_millis(100)).all_http_ok(&["1.1.1.1:80"]));
    let controller = controller(
        test_config(&[TARGET]),
        vec![StaticSource::new("one", &[("1.1.1.1", 80)])],
        prober,
        None,
    );

    let handle = controller.start(ScanOverrides::default()).unwrap();
    let original = controller.status();
    assert_eq!(original.state, ScanState::Running);

    let rejected = controller.start(ScanOverrides {
        targets: Some(vec!["https://other.example/".to_string()]),
        ..Default::default()
    });
    assert!(matches!(rejected, Err(ScanError::AlreadyRunning)));
    assert_eq!(controller.status().id, original.id);

    let run = handle.await.unwrap();
    assert_eq!(run.state, ScanState::Finished);
    assert_eq!(run.id, original.id);
    assert_eq!(run.config.unwrap().targets, vec![TARGET.to_string()]);

    let results = controller.results().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].target, TARGET);
}

#[tokio::test]
async fn test_geo_mismatch_empties_result_set() {
    let prober = Arc::new(
        MockProber::new(Duration::from_millis(2)).all_http_ok(&["1.1.1.1:80", "2.2.2.2:80"]),
    );
    let lookup: Arc<dyn GeoLookup> = Arc::new(CountryLookup("DE"));
    let controller = controller(
        test_config(&[TARGET]).with_geo(GeoPolicy::enforce("IR")),
        vec![StaticSource::new("two", &[("1.1.1.1", 80), ("2.2.2.2", 80)])],
        prober,
        Some(lookup),
    );

    let run = controller.run_once(ScanOverrides::default()).await.unwrap();
    assert_eq!(run.state, ScanState::Finished);
    assert!(controller.results().await.is_empty());

    let logs = controller.logs();
    assert_eq!(logs.iter().filter(|l| l.starts_with("[GEO]")).count(), 2);
    assert!(logs.iter().all(|l| !l.starts_with("[OK]")));
}

#[tokio::test]
async fn test_geo_match_keeps_proxies() {
    let prober = Arc::new(MockProber::new(Duration::from_millis(2)).all_http_ok(&["1.1.1.1:80"]));
    let lookup: Arc<dyn GeoLookup> = Arc::new(CountryLookup("IR"));
    let controller = controller(
        test_config(&[TARGET]).with_geo(GeoPolicy::enforce("ir")),
        vec![StaticSource::new("one", &[("1.1.1.1", 80)])],
        prober,
        Some(lookup),
    );

    controller.run_once(ScanOverrides::default()).await.unwrap();
    assert_eq!(controller.results().await.len(), 1);
    assert!(controller
        .logs()
        .contains(&"Verifying exit country: IR".to_string()));
}

#[tokio::test]
async fn test_geo_without_backend_is_configuration_error() {
    let prober = Arc::new(MockProber::new(Duration::ZERO).all_http_ok(&["1.1.1.1:80"]));
    let controller = controller(
        test_config(&[TARGET]).with_geo(GeoPolicy::enforce("IR")),
        vec![StaticSource::new("one", &[("1.1.1.1", 80)])],
        prober.clone(),
        None,
    );

    let run = controller.run_once(ScanOverrides::default()).await.unwrap();
    assert_eq!(run.state, ScanState::Failed);
    assert_eq!(
        run.error.as_deref(),
        Some(ScanError::NoGeoBackend.to_string().as_str())
    );
    assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    assert!(controller
        .logs()
        .iter()
        .any(|l| l.starts_with("Configuration error: geolocation")));
}

#[tokio::test]
async fn test_configuration_error_fails_before_probing() {
    let prober = Arc::new(MockProber::new(Duration::ZERO).all_http_ok(&["1.1.1.1:80"]));
    let controller = controller(
        test_config(&[TARGET]).with_max_per_target(0),
        vec![StaticSource::new("one", &[("1.1.1.1", 80)])],
        prober.clone(),
        None,
    );

    let run = controller.run_once(ScanOverrides::default()).await.unwrap();
    assert_eq!(run.state, ScanState::Failed);
    assert!(run.error.is_some());
    assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    assert!(controller
        .logs()
        .iter()
        .any(|l| l.starts_with("Configuration error")));

    // a failed run does not block the next one
    let run = controller
        .run_once(ScanOverrides {
            max_per_target: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(run.state, ScanState::Finished);
}

#[tokio::test]
async fn test_invalid_target_override_fails_run() {
    let prober = Arc::new(MockProber::new(Duration::ZERO));
    let controller = controller(
        test_config(&[TARGET]),
        vec![StaticSource::new("one", &[("1.1.1.1", 80)])],
        prober,
        None,
    );

    let run = controller
        .run_once(ScanOverrides {
            targets: Some(vec!["ftp://files.example/".to_string()]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(run.state, ScanState::Failed);
}

#[tokio::test]
async fn test_all_sources_failing_is_a_warning() {
    let prober = Arc::new(MockProber::new(Duration::ZERO));
    let controller = controller(
        test_config(&[TARGET]),
        vec![Arc::new(BrokenSource)],
        prober,
        None,
    );

    let run = controller.run_once(ScanOverrides::default()).await.unwrap();
    assert_eq!(run.state, ScanState::Finished);
    assert_eq!(run.candidates, 0);
    assert!(controller.logs().iter().any(|l| l.starts_with("Warning")));
    assert!(controller.results().await.is_empty());
}

#[tokio::test]
async fn test_max_candidates_truncates() {
    let prober = Arc::new(MockProber::new(Duration::ZERO));
    let controller = controller(
        test_config(&[TARGET]).with_max_candidates(Some(2)),
        vec![StaticSource::new(
            "three",
            &[("1.1.1.1", 80), ("2.2.2.2", 80), ("3.3.3.3", 80)],
        )],
        prober,
        None,
    );

    let run = controller.run_once(ScanOverrides::default()).await.unwrap();
    assert_eq!(run.candidates, 2);
    assert!(controller
        .logs()
        .iter()
        .any(|l| l == "Testing first 2 proxies due to MAX_PROXIES"));
}

#[tokio::test]
async fn test_stop_ends_scan_early() {
    let hosts: Vec<String> = (1..=50).map(|i| format!("10.2.0.{i}")).collect();
    let addresses: Vec<(&str, u16)> = hosts.iter().map(|h| (h.as_str(), 80)).collect();
    let prober = Arc::new(MockProber::new(Duration::from_millis(50)));
    let controller = controller(
        test_config(&[TARGET]).with_max_per_target(1),
        vec![StaticSource::new("many", &addresses)],
        prober.clone(),
        None,
    );

    assert!(matches!(controller.stop(), Err(ScanError::NotRunning)));

    let handle = controller.start(ScanOverrides::default()).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    controller.stop().unwrap();
    assert!(controller.status().stopping);

    let run = handle.await.unwrap();
    assert_eq!(run.state, ScanState::Finished);
    assert!(!run.stopping);
    assert!(run.probes_done < run.probes_planned);
    assert!(prober.calls.load(Ordering::SeqCst) < 100);

    let logs = controller.logs();
    assert!(logs.iter().any(|l| l == "Stopped"));
    assert!(logs.iter().any(|l| l.contains("probes not submitted")));
}

#[tokio::test]
async fn test_scan_budget_limits_submission() {
    let hosts: Vec<String> = (1..=40).map(|i| format!("10.3.0.{i}")).collect();
    let addresses: Vec<(&str, u16)> = hosts.iter().map(|h| (h.as_str(), 80)).collect();
    let prober = Arc::new(MockProber::new(Duration::from_millis(40)));
    let controller = controller(
        test_config(&[TARGET])
            .with_max_per_target(1)
            .with_scan_budget(Some(Duration::from_millis(100))),
        vec![StaticSource::new("many", &addresses)],
        prober,
        None,
    );

    let run = controller.run_once(ScanOverrides::default()).await.unwrap();
    assert_eq!(run.state, ScanState::Finished);
    assert!(run.probes_done < run.probes_planned);
}

#[tokio::test]
async fn test_results_written_to_store() {
    let output = scratch_output("results.json");
    let prober = Arc::new(MockProber::new(Duration::ZERO).all_http_ok(&["1.1.1.1:80"]));
    let controller = controller(
        test_config(&[TARGET]).with_output_file(output.clone()),
        vec![StaticSource::new("one", &[("1.1.1.1", 80)])],
        prober.clone(),
        None,
    );
    controller.run_once(ScanOverrides::default()).await.unwrap();

    let stored = ResultStore::new(output.clone()).load().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].proxy, "1.1.1.1:80");
    assert_eq!(stored[0].scheme, Scheme::Http);

    // a fresh controller serves the stored set until it completes a run
    let fresh = common::controller(
        test_config(&[TARGET]).with_output_file(output),
        vec![],
        prober,
        None,
    );
    assert_eq!(fresh.status().state, ScanState::Idle);
    let served: Vec<WorkingProxy> = fresh.results().await;
    assert_eq!(served, stored);
}

#[tokio::test]
async fn test_store_failure_fails_run() {
    let output = scratch_output("missing").join("nested").join("out.json");
    let prober = Arc::new(MockProber::new(Duration::ZERO).all_http_ok(&["1.1.1.1:80"]));
    let controller = controller(
        test_config(&[TARGET]).with_output_file(output),
        vec![StaticSource::new("one", &[("1.1.1.1", 80)])],
        prober,
        None,
    );

    let run = controller.run_once(ScanOverrides::default()).await.unwrap();
    assert_eq!(run.state, ScanState::Failed);
    // the in-memory set is still served
    assert_eq!(controller.results().await.len(), 1);
    assert!(controller
        .logs()
        .iter()
        .any(|l| l.starts_with("Error saving results")));
    assert!(controller
        .logs()
        .iter()
        .any(|l| l.starts_with("Scan failed: failed to write results")));
}

#[tokio::test]
async fn test_live_results_and_log_subscription() {
    let prober = Arc::new(MockProber::new(Duration::ZERO).all_http_ok(&["1.1.1.1:80"]));
    let controller = controller(
        test_config(&[TARGET]),
        vec![StaticSource::new("one", &[("1.1.1.1", 80)])],
        prober,
        None,
    );

    let mut rx = controller.subscribe_logs();
    controller.run_once(ScanOverrides::default()).await.unwrap();

    assert_eq!(controller.live_results().len(), 1);
    assert_eq!(rx.recv().await.unwrap(), "Scraping proxies...");
    let logs = controller.logs();
    assert_eq!(logs.first().map(String::as_str), Some("Scraping proxies..."));
    assert!(logs.iter().any(|l| l == "Working proxies: 1"));
}
