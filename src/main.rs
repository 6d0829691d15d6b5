// SPDX-License-Identifier: Apache-2.0

//! Times switchless host calls against conventional crossings.

#![deny(clippy::all)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser};
use log::info;
use switchless::config::{Config, CONFIG_TEMPLATE};
use switchless::host::Table;
use switchless::item::Status;
use switchless::Keep;

const MESSAGE: &[u8] = b"Hello World";

/// Times echo calls through a switchless worker pool against the same calls
/// made with conventional crossings.
#[derive(Parser, Debug)]
#[clap(version)]
struct Options {
    /// Logging options
    #[clap(flatten)]
    logger: LogOptions,

    /// Path of the configuration file
    #[clap(long, env = "SWITCHLESS_CONFIG")]
    config: Option<PathBuf>,

    /// Number of switchless workers, overrides the configuration file
    #[clap(long)]
    workers: Option<usize>,

    /// Number of calls to time on each path
    #[clap(long, default_value = "1000000")]
    calls: usize,

    /// Print a configuration file template and exit
    #[clap(long)]
    print_config: bool,
}

/// Common logging / output options
#[derive(Args, Debug)]
struct LogOptions {
    /// Increase log verbosity. Pass multiple times for more log output.
    ///
    /// By default we only show error messages. Passing `-v` will show warnings,
    /// `-vv` adds info, `-vvv` for debug, and `-vvvv` for trace.
    #[clap(long = "verbose", short = 'v', parse(from_occurrences))]
    verbosity: u8,

    /// Set fancier logging filters.
    ///
    /// This is equivalent to the `RUST_LOG` environment variable.
    /// For more info, see the `env_logger` crate documentation.
    #[clap(long = "log-filter", env = "SWITCHLESS_LOG")]
    log_filter: Option<String>,

    /// Set log output target ("stderr", "stdout")
    #[clap(long, default_value = "stderr")]
    log_target: LogTarget,
}

impl LogOptions {
    /// Build & initialize a global logger using env_logger::Builder.
    fn init(&self) {
        env_logger::Builder::new()
            .filter_level(self.verbosity_level())
            .parse_filters(self.log_filter.as_deref().unwrap_or_default())
            .target(self.log_target.into())
            .init();
    }

    /// Convert the -vvv.. count into a log level.
    fn verbosity_level(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

/// Targets for log output
#[derive(Debug, Clone, Copy)]
enum LogTarget {
    Stdout,
    Stderr,
}

impl FromStr for LogTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ => Err(anyhow!("unknown log target {:?}", s)),
        }
    }
}

impl From<LogTarget> for env_logger::Target {
    fn from(t: LogTarget) -> Self {
        match t {
            LogTarget::Stdout => Self::Stdout,
            LogTarget::Stderr => Self::Stderr,
        }
    }
}

fn echo(input: &[u8], output: &mut [u8]) -> Result<usize, Status> {
    let out = output
        .get_mut(..input.len())
        .ok_or(Status::BufferTooSmall)?;
    out.copy_from_slice(input);
    Ok(input.len())
}

/// Makes `calls` echo calls, returning the time they took.
fn time<F>(calls: usize, mut call: F) -> anyhow::Result<Duration>
where
    F: FnMut(&mut [u8]) -> switchless::Result<usize>,
{
    let mut output = [0u8; MESSAGE.len()];
    let start = Instant::now();

    for _ in 0..calls {
        let written = call(&mut output)?;
        if output[..written] != *MESSAGE {
            bail!("echo returned {:?}", &output[..written]);
        }
    }

    Ok(start.elapsed())
}

impl Options {
    fn execute(self) -> anyhow::Result<()> {
        if self.print_config {
            print!("{CONFIG_TEMPLATE}");
            return Ok(());
        }

        self.logger.init();
        info!("logging initialized!");
        info!("CLI opts: {:?}", self);

        let config = match &self.config {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?
                .parse::<Config>()
                .with_context(|| format!("failed to parse {}", path.display()))?,
            None => Config::default(),
        };

        let keep = Keep::new(&config, Table::new().with(echo))?;
        let workers = self.workers.unwrap_or(config.switchless.workers);
        let workers = keep.start_switchless(workers)?;
        info!("started {workers} switchless workers");

        let mut arena = keep.arena();
        let switchless = time(self.calls, |output| {
            keep.call_host_function_switchless(&mut arena, 0, MESSAGE, output)
        })?;
        let fallbacks = keep.crossings();

        let regular = time(self.calls, |output| {
            keep.call_host_function(&mut arena, 0, MESSAGE, output)
        })?;

        keep.terminate();

        println!(
            "Time spent in repeating {} calls: switchless {} vs regular {} ms, speed up: {:.2}",
            self.calls,
            switchless.as_millis(),
            regular.as_millis(),
            regular.as_secs_f64() / switchless.as_secs_f64().max(f64::MIN_POSITIVE),
        );
        if fallbacks > 0 {
            println!("{fallbacks} switchless calls fell back to a regular crossing");
        }

        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    Options::parse().execute()
}
