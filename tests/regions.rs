use papi_hl::sim::SimBackend;
use papi_hl::{Backend, Config, Error, Profiler, RegionNode};
use std::path::Path;

fn profiler(backend: SimBackend, out: &Path) -> Profiler<SimBackend> {
    let cfg = Config::default()
        .quiet()
        .output_dir(Some(out.to_path_buf()))
        .rank(Some(0));
    Profiler::new(backend, cfg)
}

fn region(p: &Profiler<SimBackend>, name: &str) -> RegionNode {
    let tid = p.backend().thread_id();
    p.with_store(|s| s.region(tid, name).cloned())
        .unwrap()
        .unwrap()
}

#[test]
fn region_count_matches_pairs() {
    let tmp = tempfile::tempdir().unwrap();
    let p = profiler(SimBackend::default(), tmp.path());
    for n in 1..=5 {
        p.region_begin("loop").unwrap();
        p.region_end("loop").unwrap();
        assert_eq!(region(&p, "loop").region_count(), n);
    }
}

#[test]
fn delta_totals_sum_over_pairs() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = SimBackend::empty()
        .event("ops", 0, 7)
        .event("misses", 0, 2)
        .cycles_per_read(5);
    let p = profiler(backend, tmp.path());
    p.set_events(Some("ops,misses")).unwrap();
    for _ in 0..4 {
        p.region_begin("kernel").unwrap();
        p.region_end("kernel").unwrap();
    }
    let node = region(&p, "kernel");
    assert_eq!(node.event(0).unwrap().total, 4 * 7);
    assert_eq!(node.event(1).unwrap().total, 4 * 2);
    assert_eq!(node.cycles(), 4 * 5);
    assert!(node.event(2).is_none());
}

#[test]
fn reads_are_kept_in_call_order() {
    let tmp = tempfile::tempdir().unwrap();
    let p = profiler(SimBackend::default(), tmp.path());
    p.set_events(Some("PAPI_TOT_INS")).unwrap();
    p.region_begin("phases").unwrap();
    for _ in 0..3 {
        p.region_read("phases").unwrap();
    }
    p.region_end("phases").unwrap();

    let node = region(&p, "phases");
    let ins = node.event(0).unwrap();
    assert_eq!(ins.reads, vec![100, 200, 300]);
    assert_eq!(ins.total, 400);
    assert_eq!(node.values[1].reads, vec![10, 20, 30]);
    assert!(node.values[0].reads.is_empty());
}

#[test]
fn reads_accumulate_over_invocations() {
    let tmp = tempfile::tempdir().unwrap();
    let p = profiler(SimBackend::default(), tmp.path());
    p.set_events(Some("PAPI_TOT_INS")).unwrap();
    for _ in 0..2 {
        p.region_begin("R").unwrap();
        p.region_read("R").unwrap();
        p.region_end("R").unwrap();
    }
    let ins = region(&p, "R").event(0).cloned().unwrap();
    assert_eq!(ins.reads, vec![100, 100]);
    assert_eq!(ins.total, 400);
}

#[test]
fn unmatched_calls_create_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let p = profiler(SimBackend::default(), tmp.path());
    p.region_begin("A").unwrap();
    p.region_end("A").unwrap();

    let err = p.region_end("never").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Cannot find matching region for region_end(\"never\")"
    );
    let err = p.region_read("never").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Cannot find matching region for region_read(\"never\")"
    );

    let tid = p.backend().thread_id();
    assert!(p.with_store(|s| s.region(tid, "never").is_none()).unwrap());
    assert_eq!(p.with_store(|s| s.regions(tid).count()).unwrap(), 1);
    assert!(p.is_active());
    assert!(p.with_store(|s| s.is_balanced()).unwrap());
}

#[test]
fn set_events_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let p = profiler(SimBackend::default(), tmp.path());
    p.set_events(Some("PAPI_TOT_CYC")).unwrap();
    let first = p.registry().unwrap();
    assert!(p.set_events(Some("PAPI_TOT_INS,perf::TASK-CLOCK")).is_ok());
    assert!(p.set_events(None).is_ok());
    let second = p.registry().unwrap();
    assert_eq!(first.names(), second.names());
    assert_eq!(second.names(), vec!["PAPI_TOT_CYC"]);
}

#[test]
fn events_come_from_config() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = Config::default()
        .quiet()
        .output_dir(Some(tmp.path().to_path_buf()))
        .events(Some(String::from("perf::TASK-CLOCK")));
    let p = Profiler::new(SimBackend::default(), cfg);
    p.region_begin("A").unwrap();
    assert_eq!(p.registry().unwrap().names(), vec!["perf::TASK-CLOCK"]);

    // An explicit list wins over the configuration.
    let cfg = Config::default()
        .quiet()
        .output_dir(Some(tmp.path().to_path_buf()))
        .events(Some(String::from("perf::TASK-CLOCK")));
    let p = Profiler::new(SimBackend::default(), cfg);
    p.set_events(Some("PAPI_TOT_INS")).unwrap();
    assert_eq!(p.registry().unwrap().names(), vec!["PAPI_TOT_INS"]);
}

// Instant events are summed at every end rather than keeping the last reading.
#[test]
fn instant_events_add_up() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = SimBackend::empty()
        .event("ops", 0, 3)
        .instant_event("temperature", 1, 40);
    let p = profiler(backend, tmp.path());
    p.set_events(Some("ops, temperature=instant")).unwrap();
    for _ in 0..3 {
        p.region_begin("hot").unwrap();
        p.region_read("hot").unwrap();
        p.region_end("hot").unwrap();
    }
    let node = region(&p, "hot");
    let registry = p.registry().unwrap();
    assert_eq!(registry.names(), vec!["ops", "temperature"]);

    let ops = node.event(0).unwrap();
    assert_eq!(ops.total, 3 * 6);
    let temperature = node.event(1).unwrap();
    assert_eq!(temperature.total, 3 * 40);
    assert_eq!(temperature.reads, vec![40, 40, 40]);
}

#[test]
fn unbalanced_regions_produce_no_report() {
    let tmp = tempfile::tempdir().unwrap();
    let p = profiler(SimBackend::default(), tmp.path());
    p.region_begin("open").unwrap();
    p.region_begin("closed").unwrap();
    p.region_end("closed").unwrap();

    assert!(!p.is_output_generated());
    p.print_output();
    assert!(p.is_output_generated());
    assert!(p.report_path().is_none());
    assert!(!tmp.path().join("papi").join("rank_0000").exists());

    // Later regions do not bring output back.
    p.region_end("open").unwrap();
    p.print_output();
    assert!(p.report_path().is_none());
}

#[test]
fn read_failure_deactivates_for_good() {
    let tmp = tempfile::tempdir().unwrap();
    let p = profiler(SimBackend::default().fail_reads_after(4), tmp.path());
    p.set_events(Some("PAPI_TOT_INS")).unwrap();
    p.region_begin("A").unwrap();
    p.region_read("A").unwrap();
    p.region_end("A").unwrap();

    assert!(matches!(p.region_read("A"), Err(Error::System(_))));
    assert!(!p.is_active());
    assert!(matches!(p.region_begin("A"), Err(Error::Deactivated)));
    assert!(matches!(p.set_events(None), Err(Error::Deactivated)));
    assert!(matches!(p.init(), Err(Error::Deactivated)));
    assert!(!p.backend().any_session_running());
    assert!(p.with_store(|_| ()).is_none());
}

#[test]
fn component_limits_and_multiplexing() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = SimBackend::default().max_events(0, 1);
    let p = profiler(backend, tmp.path());
    p.set_events(Some("PAPI_TOT_INS,PAPI_TOT_CYC")).unwrap();
    assert_eq!(p.registry().unwrap().names(), vec!["PAPI_TOT_INS"]);

    let cfg = Config::default()
        .quiet()
        .multiplex()
        .output_dir(Some(tmp.path().to_path_buf()));
    let p = Profiler::new(SimBackend::default().max_events(0, 1), cfg);
    p.set_events(Some("PAPI_TOT_INS,PAPI_TOT_CYC")).unwrap();
    assert!(p.backend().is_multiplexing());
    assert_eq!(
        p.registry().unwrap().names(),
        vec!["PAPI_TOT_INS", "PAPI_TOT_CYC"]
    );
    p.region_begin("A").unwrap();
    p.region_end("A").unwrap();
    assert!(p.backend().multiplexed_sessions() > 0);
    assert_eq!(region(&p, "A").event(1).unwrap().total, 200);
}

#[test]
fn multiplexing_not_supported_is_not_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = Config::default()
        .quiet()
        .multiplex()
        .output_dir(Some(tmp.path().to_path_buf()));
    let p = Profiler::new(SimBackend::default().without_multiplexing(), cfg);
    p.init().unwrap();
    assert!(p.is_active());
    assert!(!p.backend().is_multiplexing());
}
