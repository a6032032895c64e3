use serde::Serialize;
use std::io;
use std::time::Instant;
use tiervm::config::{JitMode, RuntimeConfig};
use tiervm::vm::native::format_value;
use tiervm::{Value, Vm};

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    jit_on_secs: f64,
    jit_off_secs: f64,
    rust_time_secs: f64,
    jit_compiled: usize,
    result: String,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

// Rust reference implementations, matching the listings' 32-bit semantics

fn rust_sum_loop() -> i32 {
    let mut sum: i32 = 0;
    let mut n: i32 = 1_000_000;
    while n != 0 {
        sum = sum.wrapping_add(n);
        n -= 1;
    }
    sum
}

fn rust_nested_loop() -> i32 {
    let mut total: i32 = 0;
    for i in 0..500_i32 {
        for j in 0..500_i32 {
            total = total.wrapping_add(i.wrapping_mul(j));
        }
    }
    total
}

fn rust_fibonacci(n: i32) -> i32 {
    if n < 2 {
        n
    } else {
        rust_fibonacci(n - 1) + rust_fibonacci(n - 2)
    }
}

fn rust_float_loop() -> f32 {
    let mut x = 0.0_f32;
    for _ in 0..1_000_000 {
        x = x * 0.5 + 1.0;
    }
    x
}

fn time_rust<T, F>(f: F) -> f64
where
    F: FnOnce() -> T,
{
    let start = Instant::now();
    std::hint::black_box(f());
    start.elapsed().as_secs_f64()
}

struct Run {
    secs: f64,
    value: Option<Value>,
    rendered: String,
    jit_compiled: usize,
}

fn run_listing(name: &str, jit_enabled: bool) -> Run {
    let path = format!("{}/programs/{}.tasm", env!("CARGO_MANIFEST_DIR"), name);

    let config = RuntimeConfig {
        jit_mode: if jit_enabled {
            JitMode::On
        } else {
            JitMode::Off
        },
        jit_threshold: 0, // Compile on first call for benchmarking
        ..Default::default()
    };

    let program = match tiervm::load_file(&path) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("benchmark {} failed to load: {}", name, e);
            return Run {
                secs: 0.0,
                value: None,
                rendered: String::new(),
                jit_compiled: 0,
            };
        }
    };

    let mut vm = Vm::with_output(program, &config, Box::new(io::sink()));
    let start = Instant::now();
    let result = vm.run();
    let secs = start.elapsed().as_secs_f64();

    let value = match result {
        Ok(value) => Some(value),
        Err(e) => {
            eprintln!("benchmark {} (jit={}) failed: {}", name, jit_enabled, e);
            None
        }
    };

    Run {
        secs,
        value,
        rendered: value.map(|v| format_value(vm.heap(), v)).unwrap_or_default(),
        jit_compiled: vm.jit_compile_count(),
    }
}

fn bench(name: &str, rust_time_secs: f64) -> BenchmarkResult {
    let on = run_listing(name, true);
    let off = run_listing(name, false);
    if on.value != off.value {
        eprintln!(
            "benchmark {}: tiers disagree ({} vs {})",
            name, on.rendered, off.rendered
        );
    }
    BenchmarkResult {
        name: name.to_string(),
        jit_on_secs: on.secs,
        jit_off_secs: off.secs,
        rust_time_secs,
        jit_compiled: on.jit_compiled,
        result: off.rendered,
    }
}

fn main() {
    let results = vec![
        bench("sum_loop", time_rust(rust_sum_loop)),
        bench("nested_loop", time_rust(rust_nested_loop)),
        bench("fibonacci", time_rust(|| rust_fibonacci(27))),
        bench("float_loop", time_rust(rust_float_loop)),
    ];

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to encode results: {}", e),
    }
}
