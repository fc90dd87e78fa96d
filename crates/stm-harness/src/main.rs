// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Grading harness CLI
//!
//! `harness <seed> <reference library path> <tested library path>...`
//!
//! The first library is the reference implementation: its phase times become
//! the timeout budgets of every candidate after it. Exit codes: 0 when all
//! candidates pass, 1 on a correctness failure, rejection, or usage error,
//! 2 on a fatality while worker threads may still be running inside an
//! artifact (which then must never be unloaded).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stm_harness::{
    clock, grading::PhaseBudgets, measure, Bank, HarnessResult, Params, TmLibrary, Workload,
};

#[derive(Debug, Parser)]
#[command(name = "harness", about = "Grade software transactional memory implementations")]
struct Args {
    /// Seed for the performance-measurement PRNG.
    seed: u64,
    /// Path to the reference implementation.
    reference: PathBuf,
    /// Paths to the candidate implementations, graded in order.
    candidates: Vec<PathBuf>,
}

fn print_preamble(params: &Params) {
    println!("Worker threads:       {}", params.workers);
    println!("TX per worker:        {}", params.tx_per_worker);
    println!("Repetitions:          {}", params.repeats);
    println!("Initial accounts:     {}", params.accounts);
    println!("Expected accounts:    {}", params.expected_accounts);
    println!("Initial balance:      {}", params.init_balance);
    println!("Long TX probability:  {}", params.prob_long);
    println!("Allocation TX prob.:  {}", params.prob_alloc);
    println!("Slow trigger factor:  {}", params.slow_factor);
    match clock::resolution() {
        clock::INVALID_TICK => println!("Clock resolution:     <unknown>"),
        resolution => println!("Clock resolution:     {resolution} ns"),
    }
    println!("Seed value:           {}", params.seed);
}

/// Evaluate every artifact in order; `Ok(true)` when all passed.
fn evaluate(params: &Params, libraries: &[PathBuf]) -> HarnessResult<bool> {
    let per_tx_div = (params.workers * params.tx_per_worker) as f64;
    let mut reference_ms = 0.0;
    let mut budgets: Option<PhaseBudgets> = None;

    for path in libraries {
        let is_reference = budgets.is_none();
        println!(
            "Evaluating '{}'{}...",
            path.display(),
            if is_reference { " (reference)" } else { "" }
        );
        let library = Arc::new(TmLibrary::open(path)?);
        let bank = Arc::new(Bank::new(library, params.bank_config())?);

        let verdict = match measure(
            Arc::clone(&bank) as Arc<dyn Workload>,
            params.workers,
            params.repeats,
            params.seed,
            budgets.unwrap_or_default(),
        ) {
            Ok(verdict) => verdict,
            Err(err) => {
                // Worker threads were abandoned inside the artifact; the
                // library must stay loaded, so skip all destructors.
                tracing::error!("{err}");
                std::process::exit(2);
            }
        };

        let times = match verdict {
            Ok(times) => times,
            Err(violation) => {
                println!("{violation}");
                return Ok(false);
            }
        };

        let perf_ms = times.perf as f64 / 1_000_000.0;
        if is_reference {
            budgets = Some(PhaseBudgets::from_reference(&times, params.slow_factor));
            reference_ms = perf_ms;
            println!("Total user execution time: {perf_ms} ms");
        } else {
            println!(
                "Total user execution time: {perf_ms} ms -> {} speedup",
                reference_ms / perf_ms
            );
        }
        println!(
            "Average TX execution time: {} ns",
            times.perf as f64 / per_tx_div
        );
    }
    Ok(true)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Usage problems share the plain failure exit code.
            eprint!("{err}");
            return ExitCode::from(1);
        }
    };

    let params = Params::detect(args.seed);
    print_preamble(&params);

    let mut libraries = vec![args.reference];
    libraries.extend(args.candidates);

    match evaluate(&params, &libraries) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(1)
        }
    }
}
