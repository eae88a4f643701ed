use std::path;
use std::process;
use std::sync::Arc;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use binsort::{ExternalSorter, ThreadPool};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let input = arg_parser.value_of("input").expect("value is required");
    let output_dir = arg_parser.value_of("output_dir").expect("value is required");
    let memory = arg_parser.value_of("memory").expect("value has a default");
    let memory = memory.parse::<ByteSize>().expect("value is pre-validated").as_u64() as usize;
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let pool = match threads {
        Some(threads) => ThreadPool::with_workers(threads),
        None => ThreadPool::new(),
    };
    let pool = match pool {
        Ok(pool) => Arc::new(pool),
        Err(err) => {
            log::error!("thread pool initialization error: {}", err);
            process::exit(1);
        }
    };

    let mut sorter: ExternalSorter<u32> =
        match ExternalSorter::new(memory, input, path::Path::new(output_dir), pool) {
            Ok(sorter) => sorter,
            Err(err) => {
                log::error!("sorter initialization error: {}", err);
                process::exit(1);
            }
        };

    if let Err(err) = sorter.sort() {
        log::error!("data sorting error: {}", err);
        process::exit(1);
    }

    log::info!("done ({} intermediate runs)", sorter.run_count());
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("binsort")
        .author("Dmitry P. <dapper1291@gmail.com>")
        .about("external sorter for binary files of fixed-width numbers")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("binary file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output_dir")
                .short('o')
                .long("output-dir")
                .help("directory for the result file and intermediate data")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("memory")
                .short('m')
                .long("memory")
                .help("memory budget")
                .takes_value(true)
                .default_value("128MiB")
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Memory size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of worker threads")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
