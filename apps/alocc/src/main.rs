// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use alocc::AloccConfig;
use anyhow::Context;
use env_logger::Target;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use structopt::StructOpt;

const LOG_FILE: &str = "ALOCC_loss.log";

#[derive(StructOpt)]
#[structopt(name = "alocc", about = "Adversarially learned one-class novelty detection on MNIST")]
struct Arguments {
    /// YAML experiment configuration; defaults reproduce the MNIST experiment
    #[structopt(short, long, global = true, parse(from_os_str))]
    config: Option<PathBuf>,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Train R and D on the training images of the attention label
    Train {
        #[structopt(short, long)]
        epochs: Option<usize>,
        #[structopt(short, long)]
        attention_label: Option<u8>,
    },
    /// Print D(R(x)) for every test image of the attention label
    Test {
        /// checkpoint to load; defaults to the one of the last epoch
        #[structopt(short, long, parse(from_os_str))]
        weights: Option<PathBuf>,
    },
    /// Report how well the scores separate the attention label from other digits
    Evaluate {
        #[structopt(short, long, parse(from_os_str))]
        weights: Option<PathBuf>,
    },
}

/// Log records go to the log file and to stdout.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write_all(buf)?;
        std::io::stdout().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        std::io::stdout().flush()
    }
}

fn init_logger(log_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create logs dir: {}", log_dir.display()))?;
    let logfile = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE))?;
    let _logger = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(Tee { file: logfile })))
        .try_init();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Arguments::from_args();
    let mut config = match &args.config {
        Some(path) => AloccConfig::from_file(path)?,
        None => AloccConfig::default(),
    };
    if let Command::Train {
        epochs,
        attention_label,
    } = &args.command
    {
        config.epochs = epochs.unwrap_or(config.epochs);
        config.attention_label = attention_label.unwrap_or(config.attention_label);
        config.validate()?;
    }
    init_logger(&config.log_dir)?;

    match args.command {
        Command::Train { .. } => {
            let history = alocc::run_training(&config)?;
            log::info!(
                "trained {} batches, final reconstruction loss {:.4}",
                history.len(),
                history.g_recon_losses.last().copied().unwrap_or(f32::NAN)
            );
        }
        Command::Test { weights } => {
            let weights = weights.unwrap_or_else(|| alocc::default_weights(&config));
            for (i, score) in alocc::run_test(&config, &weights)?.iter().enumerate() {
                println!("{:5}: {}", i, score);
            }
        }
        Command::Evaluate { weights } => {
            let weights = weights.unwrap_or_else(|| alocc::default_weights(&config));
            println!("{}", alocc::run_evaluation(&config, &weights)?);
        }
    }
    Ok(())
}
