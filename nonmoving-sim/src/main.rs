use clap::Parser as ClapParser;
use std::process;

use nonmoving::{BlockRef, Collector, HeapSettings};
use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Drives the non-moving heap through allocation and collection cycles
/// with a random survival pattern.
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of collection cycles
    #[arg(long, default_value_t = 8)]
    cycles: usize,

    /// Allocations per cycle
    #[arg(long, default_value_t = 100_000)]
    allocations: usize,

    /// Largest allocation request in bytes
    #[arg(long, default_value_t = 256)]
    max_size: usize,

    /// Probability that a live block survives a cycle
    #[arg(long, default_value_t = 0.3)]
    survival: f64,

    /// Seed of the allocation pattern
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Bytes of block storage per segment
    #[arg(long, default_value_t = HeapSettings::default().segment_size)]
    segment_size: usize,

    /// Keep at most this many free segments after a sweep
    #[arg(long)]
    max_free_segments: Option<usize>,

    /// Zero dead memory while sweeping
    #[arg(long)]
    sanity: bool,

    /// Run the heap consistency check after every cycle
    #[arg(long)]
    verify: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if !(0.0..=1.0).contains(&cli.survival) {
        eprintln!("--survival must be between 0.0 and 1.0");
        process::exit(1);
    }
    if cli.max_size == 0 {
        eprintln!("--max-size must be at least 1");
        process::exit(1);
    }

    let mut settings = HeapSettings {
        segment_size: cli.segment_size,
        ..HeapSettings::default()
    };
    settings.sanity_clear |= cli.sanity;
    if cli.max_free_segments.is_some() {
        settings.max_free_segments = cli.max_free_segments;
    }

    let collector = match Collector::new(settings) {
        Ok(collector) => collector,
        Err(err) => {
            eprintln!("Invalid heap settings: {}", err);
            process::exit(1);
        }
    };
    let mutator = collector.mutator();
    let mut rng = SmallRng::seed_from_u64(cli.seed);
    let mut live: Vec<BlockRef> = Vec::new();

    for cycle in 0..cli.cycles {
        for _ in 0..cli.allocations {
            let size = rng.gen_range(1..=cli.max_size);
            match mutator.allocate(size) {
                Ok(block) => {
                    mutator.with_block_mut(block, |bytes| bytes.fill(cycle as u8));
                    live.push(block);
                }
                Err(err) => {
                    eprintln!("Allocation of {} bytes failed: {}", size, err);
                    process::exit(1);
                }
            }
        }

        live.retain(|_| rng.gen_bool(cli.survival));
        log::debug!("cycle {}: {} blocks survive", cycle, live.len());

        let stats = collector.collect(|marker| {
            for &block in &live {
                marker.mark(block);
            }
        });

        let census = if cli.verify {
            match collector.with_heap(|heap| heap.verify()) {
                Ok(census) => census,
                Err(err) => {
                    eprintln!("Heap corrupted after cycle {}: {}", cycle, err);
                    process::exit(1);
                }
            }
        } else {
            collector.census()
        };

        println!("== cycle {} ==", cycle);
        println!("  {}", stats);
        println!(
            "  segments: {} active, {} filled, {} free, {} released",
            census.active, census.filled, census.free, census.released
        );
    }
}
