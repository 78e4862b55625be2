// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! MIND differentiation tool: derive one request against a source file and
//! print the generated functions.

use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{anyhow, Context};
use clap::Parser;

use mindad::{differentiate_source, DiffMode, DiffRequest, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "mindad", about = "Source-to-source automatic differentiation")]
struct Cli {
    /// Input source file.
    #[arg(value_name = "FILE")]
    input: PathBuf,
    /// Function to differentiate (`f` or `Owner::method`).
    #[arg(long, value_name = "NAME")]
    func: String,
    /// forward|pushforward|vector|vector_pushforward|reverse|pullback|
    /// reverse_forw|hessian|hessian_diagonal|jacobian|error
    #[arg(long, value_name = "MODE", default_value = "reverse")]
    mode: String,
    /// Independent variables, e.g. "x, arr[1], arr[0:3]".
    #[arg(long, value_name = "LIST")]
    args: Option<String>,
    /// Parameter count of the target, to pick among overloads.
    #[arg(long)]
    arity: Option<usize>,
    /// TOML file with an `[engine]` table.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print progress notes to stderr.
    #[arg(long)]
    verbose: bool,
    /// Print the request graph after the generated code.
    #[arg(long)]
    emit_graph: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        let text = format!("{err:#}");
        if text.starts_with("error") {
            eprintln!("{text}");
        } else {
            eprintln!("error: {text}");
        }
        process::exit(1);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let source = fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.verbose |= cli.verbose;

    let mode: DiffMode = cli.mode.parse().map_err(|msg: String| anyhow!(msg))?;
    let mut request = DiffRequest::new(cli.func.clone(), mode);
    if let Some(args) = &cli.args {
        request = request.with_args(args)?;
    }
    if let Some(arity) = cli.arity {
        request = request.with_arity(arity);
    }

    let derivation =
        differentiate_source(&source, &request, &config).map_err(|e| anyhow!(e.render(&source)))?;
    for note in &derivation.notes {
        eprintln!("note: {note}");
    }
    print!("{}", derivation.to_source());
    if cli.emit_graph {
        println!();
        print!("{}", derivation.graph);
    }
    Ok(())
}
