use clap::Parser as ClapParser;
use parking_lot::Mutex;
use std::{process, thread, time::Instant};

use substrate::{
    Cell, Error, GcStats, Result, Runtime, RuntimeCreateInfo, STUB_POOL, StubRef,
};

const GLOBAL_SLOTS: usize = 16;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Independent runtimes, one per thread
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Workload steps per runtime
    #[arg(short, long, default_value_t = 10_000)]
    iterations: usize,

    /// Stub allocations between requested collections
    #[arg(long)]
    ballast: Option<usize>,

    /// Cells added whenever the value stack grows
    #[arg(long)]
    stack_chunk: Option<usize>,

    /// Multiplier for units per pool segment
    #[arg(long)]
    segment_scale: Option<usize>,

    /// Upper bound in bytes for each runtime's pools
    #[arg(long)]
    memory_limit: Option<usize>,

    /// Force protocol checks on or off
    #[arg(long)]
    checked: Option<bool>,

    /// Raise a recoverable failure every N steps (0 never fails)
    #[arg(long, default_value_t = 7)]
    fail_every: usize,
}

#[derive(Debug)]
struct Report {
    worker: usize,
    gc: GcStats,
    failures: usize,
    out_of_memory: usize,
    live_stubs: usize,
    mem_usage: usize,
    millis: u128,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let reports = Mutex::new(Vec::with_capacity(cli.threads));
    let failed = thread::scope(|scope| {
        let handles: Vec<_> = (0..cli.threads)
            .map(|worker| {
                let cli = &cli;
                let reports = &reports;
                scope.spawn(move || match run_worker(worker, cli) {
                    Ok(report) => {
                        reports.lock().push(report);
                        true
                    }
                    Err(err) => {
                        eprintln!("worker {worker}: {err}");
                        false
                    }
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join())
            .filter(|outcome| !matches!(outcome, Ok(true)))
            .count()
    });

    let mut reports = reports.into_inner();
    reports.sort_by_key(|report| report.worker);
    for report in &reports {
        println!(
            "worker {:>2}: {:>5} collections, {:>8} swept, {:>5} failures caught, \
             {:>3} out of memory, {:>5} live stubs, {:>9} bytes, {} ms",
            report.worker,
            report.gc.collections,
            report.gc.total_swept,
            report.failures,
            report.out_of_memory,
            report.live_stubs,
            report.mem_usage,
            report.millis,
        );
    }

    if failed > 0 {
        eprintln!("{failed} of {} workers failed", cli.threads);
        process::exit(1);
    }
}

fn run_worker(worker: usize, cli: &Cli) -> Result<Report> {
    let started = Instant::now();
    let mut rt = Runtime::new(RuntimeCreateInfo {
        ballast: cli.ballast,
        stack_chunk: cli.stack_chunk,
        segment_scale: cli.segment_scale,
        memory_limit: cli.memory_limit,
        checked: cli.checked,
        ..Default::default()
    })?;
    log::info!("worker {worker}: runtime ready, checked {}", rt.settings().checked);

    let mut report = rt.rescue(|rt| drive(rt, worker, cli))?;
    rt.recycle();
    report.gc = rt.gc_stats();
    report.live_stubs = rt.pools().stats(STUB_POOL).live;
    report.mem_usage = rt.pools().mem_usage();
    report.millis = started.elapsed().as_millis();
    Ok(report)
}

fn drive(rt: &mut Runtime, worker: usize, cli: &Cli) -> Result<Report> {
    let globals = rt.alloc_root_table("globals", GLOBAL_SLOTS)?;
    let before = rt.snapshot();
    let mut failures = 0;
    let mut out_of_memory = 0;

    for iteration in 0..cli.iterations {
        match rt.rescue(|rt| step(rt, globals, iteration, cli.fail_every)) {
            Ok(()) => {}
            Err(Error::Raised { .. }) => failures += 1,
            Err(err) if err.is_out_of_memory() => {
                log::warn!("worker {worker}: step {iteration}: {err}");
                out_of_memory += 1;
                rt.recycle();
            }
            Err(err) => return Err(rt.raise_failure(err)),
        }
        rt.assert_balanced(&before);
        rt.safepoint();
    }

    Ok(Report {
        worker,
        gc: GcStats::default(),
        failures,
        out_of_memory,
        live_stubs: 0,
        mem_usage: 0,
        millis: 0,
    })
}

/// One unit of work: build a block on the value stack, attach some text,
/// keep every sixteenth block reachable from the globals and sometimes
/// fail halfway.
fn step(rt: &mut Runtime, globals: StubRef, iteration: usize, fail_every: usize) -> Result<()> {
    let level = rt.push_level("step");
    let mark = rt.stack_mark();
    for n in 0..8 {
        rt.stack_push()?.init_integer((iteration * 8 + n) as i64);
    }
    let block = rt.pop_to_array(mark)?;
    rt.manage(block);
    rt.level_mut(level).out.init_block(block, 0);

    let text = rt.alloc_bytes_from(format!("item-{iteration}").as_bytes())?;
    rt.manage(text);
    rt.push_guard_stub(text);
    let mut value = Cell::erased();
    value.init_text(text, 0);
    rt.append_cell(block, &value)?;
    rt.pop_guard_stub(text);

    if iteration % GLOBAL_SLOTS == 0 {
        value.init_block(block, 0);
        let len = rt.stub(globals).len();
        if len < GLOBAL_SLOTS {
            rt.append_cell(globals, &value)?;
        } else {
            let slot = (iteration / GLOBAL_SLOTS) % GLOBAL_SLOTS;
            rt.stub_mut(globals).cells_mut()[slot].copy_from(&value);
        }
    }

    if fail_every > 0 && iteration % fail_every == fail_every - 1 {
        rt.alloc_cell_array(4)?;
        let err = Error::raised("workload", format!("planned failure at step {iteration}"));
        return Err(rt.raise_failure(err));
    }

    rt.drop_level(level);
    Ok(())
}
