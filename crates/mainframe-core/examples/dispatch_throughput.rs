//! Dispatch throughput of a processor complex.
//!
//! ## Usage
//!
//! ```sh
//! cargo run -p mainframe-core --release --example dispatch_throughput
//! ```
//!
//! Each processor is restarted into a no-op loop closed by an unconditional
//! branch. The harness reports instructions per second for the complex and
//! for each processor, once per batch size.

#![allow(clippy::pedantic)]

use bitflags as _;
use log as _;
use mainframe_core::{
    psw, AddressingMode, Architecture, CpuConfig, FlatStorage, InterruptKind, Machine,
    NoPresenter, Processor, Psw, PswFormat, MAX_BATCH_SIZE, MIN_BATCH_SIZE,
};
use parking_lot as _;
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const NUM_CPUS: u16 = 4;
const MEASURE: Duration = Duration::from_millis(500);
const LOOP_LEN: usize = 64;

fn storage() -> Arc<FlatStorage> {
    let storage = Arc::new(FlatStorage::new(0x1_0000));
    // BCR 0,0 no-ops, then BCR 15,1 back to 0 (R1 is 0 after reset).
    let mut code = [0x07, 0x00].repeat(LOOP_LEN - 1);
    code.extend_from_slice(&[0x07, 0xF1]);
    storage.load(0, &code).ok();

    let z = Architecture::ZArch;
    let restart = Psw {
        format: PswFormat::ExtendedControl,
        amode: AddressingMode::Bits64,
        ..Psw::default()
    };
    storage
        .load(
            z.psa().new_psw(InterruptKind::Restart),
            psw::encode(z, &restart).as_bytes(),
        )
        .ok();
    storage
}

struct Sample {
    batch_size: u32,
    elapsed: Duration,
    per_cpu: Vec<u64>,
}

impl Sample {
    fn total(&self) -> u64 {
        self.per_cpu.iter().sum()
    }

    fn rate(&self, count: u64) -> f64 {
        count as f64 / self.elapsed.as_secs_f64()
    }
}

fn measure(batch_size: u32) -> Option<Sample> {
    let config = CpuConfig {
        num_cpus: NUM_CPUS,
        batch_size,
        ..CpuConfig::default()
    };
    let mut machine = Machine::start(config, storage(), Arc::new(NoPresenter)).ok()?;
    let ctx = Arc::clone(machine.context());

    let start = Instant::now();
    for cpu in 0..NUM_CPUS {
        ctx.restart(cpu).ok()?;
    }
    thread::sleep(MEASURE);
    let processors = machine.shutdown().ok()?;
    let elapsed = start.elapsed();

    Some(Sample {
        batch_size,
        elapsed,
        per_cpu: processors.iter().map(Processor::executed).collect(),
    })
}

fn main() {
    println!("processors: {NUM_CPUS}, window: {MEASURE:?}");
    for batch_size in [MIN_BATCH_SIZE, MAX_BATCH_SIZE] {
        let Some(sample) = measure(batch_size) else {
            eprintln!("batch size {batch_size}: complex failed to start");
            continue;
        };
        println!(
            "batch {:>2}: {:>14.0} instr/s total",
            sample.batch_size,
            sample.rate(sample.total())
        );
        for (cpu, executed) in sample.per_cpu.iter().enumerate() {
            println!("  cpu-{cpu}: {:>14.0} instr/s", sample.rate(*executed));
        }
    }
}
