use log::info;

fn fibonacci(n: u32) -> u32 {
    match n {
        0 => 1,
        1 => 1,
        _ => fibonacci(n - 1) + fibonacci(n - 2),
    }
}

fn main() -> papi_hl::Result<()> {
    env_logger::init();

    // Optional event list, e.g. "perf::TASK-CLOCK,instructions"
    let events = std::env::args().nth(1);
    papi_hl::set_events(events.as_deref())?;

    for n in 20..25 {
        papi_hl::region_begin("fibonacci")?;
        let v = fibonacci(n);
        papi_hl::region_read("fibonacci")?;
        info!("fibonacci({}) = {}", n, v);
        papi_hl::region_end("fibonacci")?;
    }

    let workers: Vec<_> = (0..2)
        .map(|i| {
            std::thread::spawn(move || -> papi_hl::Result<u32> {
                let name = format!("worker_{}", i);
                papi_hl::region_begin(&name)?;
                let v = fibonacci(22 + i);
                papi_hl::region_end(&name)?;
                papi_hl::cleanup_thread()?;
                Ok(v)
            })
        })
        .collect();
    for w in workers {
        match w.join() {
            Ok(res) => info!("worker done: {}", res?),
            Err(_) => log::error!("worker panicked"),
        }
    }

    papi_hl::finalize()?;
    if let Some(path) = papi_hl::global().report_path() {
        info!("Report written to {}", path.display());
    }
    Ok(())
}
