// Run latency benchmark for the sandbox host
// Measures run() to terminal event for simple snippets on each boundary

use scriptbox::{BoundaryKind, Sandbox, SandboxConfig};
use std::time::{Duration, Instant};

/// Benchmark configuration
const ITERATIONS: usize = 50;
const WARMUP_ITERATIONS: usize = 5;

/// Latency percentiles
struct LatencyStats {
    p50: Duration,
    p95: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();

        let p50_idx = (len as f64 * 0.50) as usize;
        let p95_idx = ((len as f64 * 0.95) as usize).min(len - 1);

        let sum: Duration = samples.iter().sum();
        let mean = sum / len as u32;

        Self {
            p50: samples[p50_idx],
            p95: samples[p95_idx],
            min: samples[0],
            max: samples[len - 1],
            mean,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

/// Benchmark result
struct BenchmarkResult {
    scenario: String,
    stats: LatencyStats,
    budget: Duration,
}

impl BenchmarkResult {
    fn passed(&self) -> bool {
        self.stats.p95 < self.budget
    }

    fn print(&self) {
        println!("\n=== {} ===", self.scenario);
        self.stats.print("Latency");

        if self.passed() {
            println!("✅ PASS");
        } else {
            println!(
                "❌ FAIL: p95={:?} (target <{:?})",
                self.stats.p95, self.budget
            );
        }
    }
}

fn measure(scenario: &str, config: SandboxConfig, source: &str, budget: Duration) -> BenchmarkResult {
    let mut sandbox = match Sandbox::new(config) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            eprintln!("{}: cannot create sandbox: {}", scenario, e);
            std::process::exit(1);
        }
    };

    // Warmup
    for _ in 0..WARMUP_ITERATIONS {
        let _ = sandbox.run_to_completion(source);
    }

    let mut samples = Vec::with_capacity(ITERATIONS);
    for _ in 0..ITERATIONS {
        let start = Instant::now();
        let _ = sandbox.run_to_completion(source);
        samples.push(start.elapsed());
    }

    BenchmarkResult {
        scenario: scenario.to_string(),
        stats: LatencyStats::from_samples(samples),
        budget,
    }
}

fn main() {
    println!("=== scriptbox Run Latency Benchmark ===");
    println!("Iterations: {} (after {} warmup)", ITERATIONS, WARMUP_ITERATIONS);

    let worker = env!("CARGO_BIN_EXE_scriptbox");
    let process = SandboxConfig::default()
        .with_boundary(BoundaryKind::Process)
        .with_worker_program(worker);

    let results = vec![
        measure(
            "Thread: console.log(1+1)",
            SandboxConfig::default(),
            "console.log(1+1)",
            Duration::from_millis(100),
        ),
        measure(
            "Thread: uncaught error",
            SandboxConfig::default(),
            "throw new Error('x')",
            Duration::from_millis(100),
        ),
        measure(
            "Thread: syntax error",
            SandboxConfig::default(),
            "function broken( {",
            Duration::from_millis(20),
        ),
        measure(
            "Process: console.log(1+1)",
            process,
            "console.log(1+1)",
            Duration::from_millis(300),
        ),
    ];

    for result in &results {
        result.print();
    }

    let passed_count = results.iter().filter(|r| r.passed()).count();
    println!("\n=== Summary ===");
    println!("{}/{} scenarios within budget", passed_count, results.len());

    if passed_count != results.len() {
        std::process::exit(1);
    }
}
