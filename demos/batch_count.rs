use clap::Parser;
use offset_hash::DefaultHashBuilder;
use offset_hash::HashMap;
use offset_hash::Reducer;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

/// Counts a stream of random k-mers with a batched insert and prints how
/// the table and the cardinality estimator fared.
#[derive(Parser, Debug)]
struct Args {
    /// Total number of k-mers in the stream.
    #[arg(short = 'n', long = "total", default_value_t = 4_000_000)]
    total: usize,

    /// Number of distinct k-mers in the stream.
    #[arg(short = 'd', long = "distinct", default_value_t = 1_000_000)]
    distinct: usize,

    /// k-mer length in bases (stored 2-bit packed in a u64).
    #[arg(short = 'k', long = "kmer-length", default_value_t = 31)]
    k: u32,

    /// RNG seed.
    #[arg(long = "seed", default_value_t = 42)]
    seed: u64,
}

#[derive(Clone, Copy, Default)]
struct Add;

impl Reducer<u32> for Add {
    fn reduce(&self, existing: u32, incoming: u32) -> u32 {
        existing + incoming
    }
}

fn main() {
    let args = Args::parse();
    assert!(args.k >= 1 && args.k <= 32, "a 2-bit packed k-mer must fit in a u64");
    assert!(args.distinct > 0 && args.distinct <= args.total);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let kmer_mask = u64::MAX >> (64 - 2 * args.k);

    println!(
        "Generating {} {}-mers over {} distinct values...",
        args.total, args.k, args.distinct
    );
    let vocabulary: Vec<u64> = (0..args.distinct)
        .map(|_| rng.random::<u64>() & kmer_mask)
        .collect();
    let stream: Vec<(u64, u32)> = (0..args.total)
        .map(|_| (vocabulary[rng.random_range(0..args.distinct)], 1))
        .collect();

    let mut counts: HashMap<u64, u32, DefaultHashBuilder, Add> = HashMap::with_reducer(Add);

    let start = std::time::Instant::now();
    counts.insert_batch(&stream);
    let elapsed = start.elapsed();

    println!(
        "Inserted {} k-mers in {:.3}s ({:.1} M/s)",
        args.total,
        elapsed.as_secs_f64(),
        args.total as f64 / elapsed.as_secs_f64() / 1e6
    );
    println!("Distinct k-mers counted: {}", counts.len());
    println!(
        "Estimator said: {:.0} ({:+.2}% off)",
        counts.cardinality_estimate(),
        (counts.cardinality_estimate() / counts.len() as f64 - 1.0) * 100.0
    );
    println!(
        "Capacity: {} buckets at {:.1}% load",
        counts.capacity(),
        counts.load_factor() * 100.0
    );

    let start = std::time::Instant::now();
    let mut presence = Vec::with_capacity(vocabulary.len());
    let hits = counts.count_batch(&vocabulary, &mut presence);
    let elapsed = start.elapsed();
    println!(
        "Counted {} probes in {:.3}s ({:.1} M/s), {} present",
        vocabulary.len(),
        elapsed.as_secs_f64(),
        vocabulary.len() as f64 / elapsed.as_secs_f64() / 1e6,
        hits
    );

    let max_count = counts.iter().map(|(_, v)| *v).max().unwrap_or(0);
    let total: u64 = counts.iter().map(|(_, v)| *v as u64).sum();
    println!(
        "Counts sum to {} (max multiplicity {})",
        total, max_count
    );
}
