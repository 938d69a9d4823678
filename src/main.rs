//! nvmem-sim: trace-driven memory-device timing simulator.

use std::env;
use std::path::Path;

use nvmem_sim::config::DeviceConfig;
use nvmem_sim::device::request::Request;
use nvmem_sim::device::MemAddress;
use nvmem_sim::observer::AccessCounter;
use nvmem_sim::system::MemorySystem;
use nvmem_sim::trace::{TraceReader, TraceRecord};

const USAGE: &str = "usage: nvmem-sim [--config FILE] [--max-cycles N] [--atomic-warmup N] TRACE";

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    let mut config_path: Option<String> = None;
    let mut max_cycles: u64 = 0;
    let mut warmup: u64 = 0;
    let mut trace_path: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                config_path = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow::anyhow!("--config needs a file\n{}", USAGE))?
                        .clone(),
                );
            }
            "--max-cycles" => {
                i += 1;
                max_cycles = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--max-cycles needs a number\n{}", USAGE))?
                    .parse()?;
            }
            "--atomic-warmup" => {
                i += 1;
                warmup = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--atomic-warmup needs a number\n{}", USAGE))?
                    .parse()?;
            }
            "--help" | "-h" => {
                println!("{}", USAGE);
                return Ok(());
            }
            other if !other.starts_with('-') => trace_path = Some(other.to_owned()),
            other => anyhow::bail!("unknown option '{}'\n{}", other, USAGE),
        }
        i += 1;
    }

    let trace_path = trace_path.ok_or_else(|| anyhow::anyhow!("{}", USAGE))?;

    let cfg = match &config_path {
        Some(path) => DeviceConfig::load(Path::new(path))?,
        None => {
            let mut cfg = DeviceConfig::default();
            cfg.sanitize()?;
            cfg
        }
    };

    let mut system = MemorySystem::new(cfg)?;
    system.add_observer(Box::new(AccessCounter::new()));

    let reader = TraceReader::open(Path::new(&trace_path))?;
    let mut injected: u64 = 0;
    let mut completed: u64 = 0;
    let mut warmed: u64 = 0;

    let mut pending: Option<TraceRecord> = None;
    let mut records = reader;

    loop {
        // Pull the next record once the previous one is placed.
        if pending.is_none() {
            match records.next() {
                Some(record) => {
                    let record = record?;
                    if warmed < warmup {
                        // Warm-up accesses update wear state without timing.
                        let req = build_request(&record);
                        system.issue_atomic(&req);
                        warmed += 1;
                        continue;
                    }
                    pending = Some(record);
                }
                None => {
                    // Trace exhausted: push any buffered writes out.
                    system.drain();
                    if system.in_flight() == 0 {
                        break;
                    }
                }
            }
        }

        // Inject when the trace cycle arrives; retry under backpressure.
        let due = pending
            .as_ref()
            .is_some_and(|r| r.cycle <= system.current_cycle());
        if due {
            if let Some(record) = pending.take() {
                let req = build_request(&record);
                match system.issue_command(req) {
                    Ok(()) => {
                        injected += 1;
                        continue;
                    }
                    Err(_refused) => {
                        log::debug!("backpressure at cycle {}", system.current_cycle());
                        pending = Some(record);
                    }
                }
            }
        }

        system.cycle(1);
        completed += system.drain_completions().len() as u64;

        if max_cycles > 0 && system.current_cycle() >= max_cycles {
            log::warn!(
                "cycle limit {} reached with {} requests in flight",
                max_cycles,
                system.in_flight()
            );
            break;
        }
    }

    completed += system.drain_completions().len() as u64;

    println!(
        "simulated {} cycles, {} requests injected, {} completed",
        system.current_cycle(),
        injected,
        completed
    );
    println!();
    system.print_stats(&mut std::io::stdout())?;

    Ok(())
}

fn build_request(record: &TraceRecord) -> Request {
    let mut req = Request::new(
        record.kind,
        MemAddress {
            physical: record.address,
            ..Default::default()
        },
    );
    if let Some(data) = &record.data {
        req.data = Some(data.clone());
    }
    req
}
