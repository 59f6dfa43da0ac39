use clap::{Parser as ClapParser, builder::RangedU64ValueParser};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{
    fs::File,
    io::BufWriter,
    process,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use kette_heap::{
    GcReason, HEADER_SIZE, Heap, HeapProxy, HeapSettings, ObjectRef, RefField, RootStack, UNIT_SIZE,
};

/// `header | next | spare | payload`
const NODE_SIZE: usize = HEADER_SIZE + 24;
const NODE_TYPE: u16 = 1;
const GARBAGE_TYPE: u16 = 2;

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Concurrent mutators against the region collector", long_about = None)]
struct Cli {
    #[arg(
        long,
        default_value_t = 4,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..),
        help = "Mutator threads"
    )]
    threads: usize,

    #[arg(
        long,
        default_value_t = 16,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..),
        help = "Linked lists per mutator"
    )]
    lists: usize,

    #[arg(long, default_value_t = 200_000, help = "Mutations per mutator")]
    rounds: usize,

    #[arg(long, default_value_t = 64, help = "Heap size in MiB")]
    heap_mib: usize,

    #[arg(long, default_value_t = 128, help = "Region size in KiB")]
    region_kib: usize,

    #[arg(long, default_value_t = 5, help = "Milliseconds between heuristic requests")]
    request_interval_ms: u64,

    #[arg(long, default_value_t = 1, help = "Seed of the mutation sequence")]
    seed: u64,

    #[arg(long, help = "Write a heap dump here while the mutators are parked")]
    dump: Option<String>,
}

unsafe fn node_trace(obj: ObjectRef, visitor: &mut dyn FnMut(&RefField)) {
    // SAFETY: every object of this program is a node or a leaf of node size
    unsafe {
        if obj.type_id() == NODE_TYPE {
            visitor(obj.field(HEADER_SIZE));
            visitor(obj.field(HEADER_SIZE + 8));
        }
    }
}

fn next_field(obj: ObjectRef) -> &'static RefField {
    // SAFETY: nodes have their next slot after the header
    unsafe { obj.field(HEADER_SIZE) }
}

fn payload(obj: ObjectRef) -> u64 {
    // SAFETY: nodes end in a payload word
    unsafe { *((obj.addr() + HEADER_SIZE + 16) as *const u64) }
}

fn set_payload(obj: ObjectRef, value: u64) {
    // SAFETY: see above
    unsafe { *((obj.addr() + HEADER_SIZE + 16) as *mut u64) = value };
}

struct Shared {
    heap: Heap,
    parked: Barrier,
    release: Barrier,
    expected_bytes: AtomicUsize,
    failures: AtomicUsize,
}

/// Builds `lists` linked lists, rewiring and dropping them at random, and
/// checks every list before and after the final collection.
fn run_mutator(cli: &Cli, shared: &Shared, id: usize) {
    let roots = Arc::new(RootStack::new());
    let mut proxy = shared.heap.proxy(roots.clone());
    let mut rng = StdRng::seed_from_u64(cli.seed.wrapping_add(id as u64));
    let mut lengths = vec![0u64; cli.lists];
    for _ in 0..cli.lists {
        roots.push(ObjectRef::NULL);
    }

    for _ in 0..cli.rounds {
        let list = rng.gen_range(0..cli.lists);
        match rng.gen_range(0..20) {
            // drop the whole list
            0 => {
                roots.set(list, ObjectRef::NULL);
                lengths[list] = 0;
            }
            _ => {
                let node = match proxy.new_object(NODE_TYPE, NODE_SIZE) {
                    Ok(node) => node,
                    Err(err) => {
                        log::error!("mutator {id}: {err}");
                        shared.failures.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                };
                set_payload(node, lengths[list]);
                proxy.write_ref(node, next_field(node), roots.get(list));
                roots.set(list, node);
                lengths[list] += 1;
                if proxy.new_object(GARBAGE_TYPE, NODE_SIZE).is_err() {
                    shared.failures.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }
    }

    verify_lists(&proxy, &roots, &lengths, shared, id);
    let live: u64 = lengths.iter().sum();
    shared
        .expected_bytes
        .fetch_add(live as usize * NODE_SIZE, Ordering::Relaxed);

    proxy.enter_saferegion();
    shared.parked.wait();
    shared.release.wait();
    proxy.leave_saferegion();

    verify_lists(&proxy, &roots, &lengths, shared, id);
}

fn verify_lists(
    proxy: &HeapProxy,
    roots: &RootStack,
    lengths: &[u64],
    shared: &Shared,
    id: usize,
) {
    for (list, &len) in lengths.iter().enumerate() {
        let mut node = roots.get(list);
        for expected in (0..len).rev() {
            if node.is_null() || payload(node) != expected {
                log::error!("mutator {id}: list {list} broken at {expected}");
                shared.failures.fetch_add(1, Ordering::Relaxed);
                break;
            }
            node = proxy.read_ref(node, next_field(node));
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    builder.init();

    let settings = HeapSettings {
        heap_size: cli.heap_mib * 1024 * 1024,
        region_size: (cli.region_kib * 1024).next_multiple_of(UNIT_SIZE),
        gc_threshold: cli.heap_mib * 1024 * 1024 / 2,
        ..HeapSettings::default()
    };
    let heap = match Heap::new(settings, node_trace) {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("Error creating heap: {}", err);
            process::exit(1);
        }
    };

    let cli = Arc::new(cli);
    let shared = Arc::new(Shared {
        heap: heap.clone(),
        parked: Barrier::new(cli.threads + 1),
        release: Barrier::new(cli.threads + 1),
        expected_bytes: AtomicUsize::new(0),
        failures: AtomicUsize::new(0),
    });
    let stop = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let requester = {
        let heap = heap.clone();
        let stop = Arc::clone(&stop);
        let interval = Duration::from_millis(cli.request_interval_ms);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                heap.request_gc(GcReason::Heu);
                thread::sleep(interval);
            }
        })
    };

    let workers: Vec<_> = (0..cli.threads)
        .map(|id| {
            let cli = Arc::clone(&cli);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("mutator-{id}"))
                .spawn(move || run_mutator(&cli, &shared, id))
        })
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_else(|err| {
            eprintln!("Error spawning mutators: {}", err);
            process::exit(1);
        });

    shared.parked.wait();
    stop.store(true, Ordering::Release);
    if requester.join().is_err() {
        eprintln!("Error: request thread panicked");
        process::exit(1);
    }

    let expected = shared.expected_bytes.load(Ordering::Relaxed);
    let before = heap.reachable_bytes();
    heap.request_gc(GcReason::User);
    let after = heap.reachable_bytes();
    println!(
        "reachable {} bytes before and {} bytes after the final gc, {} bytes expected",
        before, after, expected
    );
    if before != expected || after != expected {
        shared.failures.fetch_add(1, Ordering::Relaxed);
    }

    if let Some(path) = &cli.dump {
        let written = File::create(path).and_then(|file| heap.dump_heap(&mut BufWriter::new(file)));
        if let Err(err) = written {
            eprintln!("Error writing heap dump '{}': {}", path, err);
        }
    }

    shared.release.wait();
    for worker in workers {
        if worker.join().is_err() {
            shared.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
    heap.fini();

    let stats = heap.last_gc_stats();
    println!(
        "{} gc cycles in {:.2?}: {}us total gc time, {} bytes collected",
        heap.gc_count(),
        start.elapsed(),
        heap.gc_total_time_us(),
        heap.gc_collected_total_bytes()
    );
    if let Some(stats) = stats {
        println!(
            "last cycle ({}): live {} -> {} bytes, threshold {} bytes",
            stats.reason, stats.live_bytes_before, stats.live_bytes_after, stats.heap_threshold
        );
    }

    let failures = shared.failures.load(Ordering::Relaxed);
    if failures > 0 {
        eprintln!("{} failures", failures);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_rejects_empty_workloads() {
        assert!(Cli::try_parse_from(["heap_stress", "--lists", "0"]).is_err());
        assert!(Cli::try_parse_from(["heap_stress", "--threads", "0"]).is_err());

        let cli = Cli::try_parse_from(["heap_stress", "--lists", "1", "--threads", "2"])
            .expect("valid arguments");
        assert_eq!(cli.lists, 1);
        assert_eq!(cli.threads, 2);
        assert_eq!(cli.rounds, 200_000);
    }
}
