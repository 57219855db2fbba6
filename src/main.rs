use std::process;
use std::time::Duration;

use clap::{App, Arg, ArgMatches};
use failure::{bail, Error, ResultExt};
use slog::{crit, info, o, warn, Logger};

use braid::topic::TopicRegistry;
use braid::{load_relations, terminal_logger, Config, Engine};

fn main() {
    let matches = App::new("braid")
        .version("0.1.0")
        .about("Materializes denormalized tree records from normalized change streams")
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .required(true)
                .help("Path (or file:// URI) of the YAML config file"),
        )
        .arg(
            Arg::with_name("relations")
                .long("relations")
                .takes_value(true)
                .required(true)
                .multiple(true)
                .number_of_values(1)
                .help("Paths to one or more files containing relation trees"),
        )
        .arg(
            Arg::with_name("build")
                .long("build")
                .help("Builds denormalized records using the existing state"),
        )
        .arg(
            Arg::with_name("restore")
                .long("restore")
                .help("Restores the state from existing backups"),
        )
        .arg(
            Arg::with_name("delete-state")
                .long("delete-state")
                .help("Deletes the existing state. BE VERY CAREFUL WITH THIS!!!"),
        )
        .arg(
            Arg::with_name("delete-backup")
                .long("delete-backup")
                .help("Deletes existing backups. BE VERY CAREFUL WITH THIS!!!"),
        )
        .arg(
            Arg::with_name("verify-state")
                .long("verify-state")
                .help("Checks the forward/reverse invariant of every index"),
        )
        .arg(
            Arg::with_name("run-time")
                .long("run-time")
                .takes_value(true)
                .default_value("0")
                .help("Seconds to run --build before committing, backing up and exiting; 0 runs until cancelled"),
        )
        .arg(
            Arg::with_name("debug")
                .long("debug")
                .help("Verbose log output"),
        )
        .get_matches();

    let log = terminal_logger(matches.is_present("debug"));
    if let Err(e) = run(&log, &matches) {
        crit!(log, "braid failed"; "error" => %e);
        for cause in e.iter_causes() {
            crit!(log, "caused by"; "error" => %cause);
        }
        process::exit(1);
    }
}

fn build_engine(
    log: &Logger,
    matches: &ArgMatches,
) -> Result<Engine<braid::state::RocksState>, Error> {
    let config = Config::load(matches.value_of("config").unwrap())?;
    let paths: Vec<&str> = matches.values_of("relations").unwrap().collect();
    let relations = load_relations(&paths)?;
    let registry = TopicRegistry::with_defaults();
    Engine::from_config(log.new(o!()), config, relations, &registry)
}

fn run(log: &Logger, matches: &ArgMatches) -> Result<(), Error> {
    let run_time: u64 = matches
        .value_of("run-time")
        .unwrap()
        .parse()
        .with_context(|_| "invalid --run-time")?;

    let mut engine = build_engine(log, matches)?;

    if matches.is_present("restore") {
        engine.restore()?;
    }
    if matches.is_present("delete-backup") {
        engine.delete_backups()?;
    }
    if matches.is_present("delete-state") {
        engine.delete_state()?;
    }
    if matches.is_present("verify-state") {
        let report = engine.verify_state()?;
        if report.is_empty() {
            info!(log, "state verified; all index invariants hold");
        } else {
            for (index, violations) in &report {
                warn!(log, "index invariant violated";
                      "index" => index.as_str(), "keys" => format!("{:?}", violations));
            }
            bail!("state verification failed for {} indices", report.len());
        }
    }
    if matches.is_present("build") {
        if matches.is_present("delete-state") {
            // a deleted store cannot be reused; start over on a fresh one
            engine = build_engine(log, matches)?;
        }
        engine.run(Duration::from_secs(run_time))?;
    }
    engine.close()?;
    Ok(())
}
