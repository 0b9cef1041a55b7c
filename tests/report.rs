use nix::sys::time::{TimeVal, TimeValLike};
use papi_hl::sim::SimBackend;
use papi_hl::{Backend, Config, Profiler};
use serde_json::Value;
use std::path::Path;

fn load(path: &Path) -> Value {
    let content = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&content).unwrap()
}

#[test]
fn default_events_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = Config::default()
        .quiet()
        .output_dir(Some(tmp.path().to_path_buf()))
        .rank(Some(0));
    let p = Profiler::new(SimBackend::default(), cfg);
    for _ in 0..2 {
        p.region_begin("A").unwrap();
        p.region_end("A").unwrap();
    }
    p.print_output();

    let path = p.report_path().unwrap();
    assert_eq!(path, tmp.path().join("papi").join("rank_0000"));
    let doc = load(&path);
    assert_eq!(doc["cpu in mhz"], "2400");

    let threads = doc["threads"].as_array().unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0]["id"], p.backend().thread_id().to_string());

    let a = &threads[0]["regions"][0]["A"];
    assert_eq!(a["region_count"], "2");
    let cycles: i64 = a["cycles"].as_str().unwrap().parse().unwrap();
    assert!(cycles >= 0);
    for name in &["perf::TASK-CLOCK", "PAPI_TOT_INS", "PAPI_TOT_CYC"] {
        assert!(a.get(*name).is_some(), "{} missing", name);
    }
    assert!(a.get("PAPI_FP_OPS").is_none());
    assert_eq!(a["PAPI_TOT_INS"], "200");
    assert_eq!(a["perf::TASK-CLOCK"], "2000");
}

#[test]
fn intermediate_reads_in_report() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = Config::default()
        .quiet()
        .report()
        .output_dir(Some(tmp.path().to_path_buf()))
        .rank(Some(12));
    let p = Profiler::new(SimBackend::default(), cfg);
    p.set_events(Some("PAPI_TOT_INS")).unwrap();
    p.region_begin("first").unwrap();
    p.region_end("first").unwrap();
    p.region_begin("second").unwrap();
    p.region_read("second").unwrap();
    p.region_read("second").unwrap();
    p.region_end("second").unwrap();
    p.finalize().unwrap();

    let path = p.report_path().unwrap();
    assert!(path.ends_with("papi/rank_0012"));
    let doc = load(&path);
    let regions = doc["threads"][0]["regions"].as_array().unwrap();
    let names: Vec<&String> = regions
        .iter()
        .flat_map(|r| r.as_object().unwrap().keys())
        .collect();
    assert_eq!(names, vec!["second", "first"]);

    let second = &regions[0]["second"];
    assert_eq!(second["region_count"], "1");
    assert_eq!(second["PAPI_TOT_INS"]["total"], "300");
    assert_eq!(second["PAPI_TOT_INS"]["read_1"], "100");
    assert_eq!(second["PAPI_TOT_INS"]["read_2"], "200");
    assert_eq!(second["cycles"]["read_1"], "10");
    assert_eq!(regions[1]["first"]["PAPI_TOT_INS"], "100");
}

#[test]
fn report_without_rank_gets_unique_name() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = Config::default()
        .quiet()
        .output_dir(Some(tmp.path().join("deep/er")));
    let p = Profiler::new(SimBackend::default(), cfg);
    p.region_begin("A").unwrap();
    p.region_end("A").unwrap();
    p.print_output();

    let path = p.report_path().unwrap();
    assert_eq!(path.parent().unwrap(), tmp.path().join("deep/er/papi"));
    let name = path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("rank_"));
    assert_ne!(name, "rank_XXXXXX");
    assert!(load(&path)["threads"].is_array());

    // The report is written only once.
    p.print_output();
    let files = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
    assert_eq!(files, 1);
}

#[test]
fn nothing_recorded_writes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = Config::default()
        .quiet()
        .output_dir(Some(tmp.path().to_path_buf()));
    let p = Profiler::new(SimBackend::default(), cfg);
    p.init().unwrap();
    p.print_output();
    assert!(p.report_path().is_none());
    assert!(!p.is_output_generated());
    assert!(!tmp.path().join("papi").exists());
}

#[test]
fn old_measurement_directory_is_kept() {
    let tmp = tempfile::tempdir().unwrap();
    let old = tmp.path().join("papi");
    std::fs::create_dir(&old).unwrap();
    std::fs::write(old.join("rank_0000"), "{}").unwrap();
    let past = TimeVal::seconds(1_000_000);
    nix::sys::stat::utimes(&old, &past, &past).unwrap();

    let cfg = Config::default()
        .quiet()
        .output_dir(Some(tmp.path().to_path_buf()))
        .rank(Some(0));
    let p = Profiler::new(SimBackend::default(), cfg);
    p.region_begin("A").unwrap();
    p.region_end("A").unwrap();
    p.print_output();

    let moved: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().into_string().unwrap())
        .filter(|n| n.starts_with("papi-"))
        .collect();
    assert_eq!(moved.len(), 1);
    let kept = tmp.path().join(&moved[0]).join("rank_0000");
    assert_eq!(std::fs::read_to_string(&kept).unwrap(), "{}");
    assert_ne!(load(&p.report_path().unwrap()), load(&kept));
}
