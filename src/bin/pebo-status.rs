use clap::{Arg, ArgMatches, Command};
use pebo_companion::config::{CompanionConfig, EngineOptions};
use pebo_companion::error::{Error, Result};
use pebo_companion::session::SnapshotSet;
use pebo_companion::Companion;
use std::process::ExitCode;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const LOAD_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_WINDOW_DAYS: i64 = 3650;

#[tokio::main]
async fn main() -> ExitCode {
    pretty_env_logger::init();

    let matches = Command::new("pebo-status")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Print setup status and tasks due soon for a PEBO user")
        .arg(
            Arg::new("database_url")
                .long("database-url")
                .value_name("URL")
                .env("PEBO_DATABASE_URL")
                .takes_value(true)
                .help("Realtime Database URL"),
        )
        .arg(
            Arg::new("id_token")
                .long("id-token")
                .value_name("JWT")
                .env("PEBO_ID_TOKEN")
                .takes_value(true)
                .required(true)
                .help("ID token of the user"),
        )
        .arg(
            Arg::new("window_days")
                .long("window-days")
                .value_name("DAYS")
                .takes_value(true)
                .default_value("5")
                .help("Width of the due-soon window"),
        )
        .get_matches();

    match run(&matches).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(matches: &ArgMatches) -> Result<()> {
    let config = match matches.get_one::<String>("database_url") {
        Some(url) => CompanionConfig::new(url)?,
        None => CompanionConfig::from_env()?,
    };
    let window_days = match matches.get_one::<String>("window_days") {
        Some(days) => parse_window_days(days)?,
        None => 5,
    };
    let token = matches
        .get_one::<String>("id_token")
        .ok_or_else(|| Error::config("--id-token is required"))?;

    let options = EngineOptions::default().with_due_soon_window_days(window_days);
    let settle = options.debounce;
    let companion = Companion::connect(&config, options)?;
    let identity = companion.sign_in_with_id_token(token)?;
    println!("User: {}", identity);

    let started = Instant::now();
    while !all_settled(&companion.snapshots()) {
        if started.elapsed() > LOAD_TIMEOUT {
            eprintln!("warning: not every feed answered within {:?}", LOAD_TIMEOUT);
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    sleep(settle).await;

    let snapshots = companion.snapshots();
    for (name, error) in [
        ("network", &snapshots.network.error),
        ("tasks", &snapshots.tasks.error),
        ("devices", &snapshots.devices.error),
        ("profile", &snapshots.profile.error),
    ] {
        if let Some(error) = error {
            eprintln!("warning: {} feed: {}", name, error);
        }
    }

    let state = companion.refresh();
    if state.setup.is_complete() {
        println!("Setup: complete");
    } else {
        let missing: Vec<String> = state.setup.missing_items().iter().map(ToString::to_string).collect();
        println!("Setup: missing {}", missing.join(", "));
    }

    if state.due_soon.is_empty() {
        println!("No tasks due in the next {} days", window_days);
    }
    for due in &state.due_soon {
        println!(
            "  [{}] {} ({:?}, due {})",
            due.time_remaining,
            due.task.description,
            due.task.priority,
            due.effective_deadline.format("%Y-%m-%d %H:%M")
        );
    }

    companion.sign_out();
    Ok(())
}

fn parse_window_days(days: &str) -> Result<i64> {
    let parsed = days
        .trim()
        .parse::<i64>()
        .map_err(|e| Error::config(format!("invalid --window-days '{}': {}", days, e)))?;
    if !(0..=MAX_WINDOW_DAYS).contains(&parsed) {
        return Err(Error::config(format!(
            "--window-days must be between 0 and {}, got {}",
            MAX_WINDOW_DAYS, parsed
        )));
    }
    Ok(parsed)
}

fn all_settled(snapshots: &SnapshotSet) -> bool {
    let settled = |loaded: bool, error: &Option<String>| loaded || error.is_some();
    settled(snapshots.network.loaded, &snapshots.network.error)
        && settled(snapshots.tasks.loaded, &snapshots.tasks.error)
        && settled(snapshots.devices.loaded, &snapshots.devices.error)
        && settled(snapshots.profile.loaded, &snapshots.profile.error)
}
