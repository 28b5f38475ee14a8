use std::process::ExitCode;
use std::time::Duration;

use event_monitor::analysis::localize::localize;
use event_monitor::analysis::window::Scheduler;
use event_monitor::clock::SystemClock;
use event_monitor::config::{self, Config, QueueKind, DEFAULT_CONFIG_PATH};
use event_monitor::ingest::queue::PostgresQueue;
use event_monitor::ingest::replay::{self, ReplaySource};
use event_monitor::ledger::Ledger;
use event_monitor::locations;
use event_monitor::logging::{self, Component};
use event_monitor::model::{AggregateRecord, MonitorError};
use event_monitor::report;

fn connect_queue(config: &Config) -> Result<PostgresQueue, MonitorError> {
    let url = config.queue.database_url.as_deref().ok_or_else(|| {
        MonitorError::Config("DATABASE_URL (or queue.database_url) must be set".into())
    })?;
    PostgresQueue::connect(
        url,
        &config.queue.name,
        Duration::from_secs(config.queue.visibility_timeout_secs),
    )
}

fn run(config: Config) -> Result<(), MonitorError> {
    let records = locations::load_manifest(&config.manifest)?;
    let ledger = Ledger::from_records(&records);

    let scheduler = Scheduler::new(ledger, config.run.clone());
    let print_record = |record: &AggregateRecord| {
        logging::info(Component::Scheduler, None, &record.to_string());
    };

    let outcome = match config.queue.kind {
        QueueKind::Postgres => {
            let mut queue = connect_queue(&config)?;
            scheduler.run(&mut queue, &SystemClock, None, print_record)?
        }
        QueueKind::Replay => {
            let path = config.queue.replay_path.as_deref().unwrap_or_default();
            logging::info(Component::Queue, None, &format!("Replaying messages from {}", path));
            replay::run_replay(scheduler, ReplaySource::open(path)?, print_record)?
        }
    };

    let localization = localize(&outcome.ledger, &config.localization);
    match &localization {
        Some(result) => logging::info(
            Component::Localizer,
            None,
            &format!(
                "x: {:.6}, y: {:.6}, value: {:.6}",
                result.best.x, result.best.y, result.best.value
            ),
        ),
        None => logging::warn(Component::Localizer, None, "No locations to localize from"),
    }

    report::write_reports(&config.output, &outcome, localization.as_ref())
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let arg = std::env::args().nth(1);
    let explicit = arg.is_some();
    let path = arg.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = match config::load_config(&path, explicit) {
        Ok(config) => config.with_database_url(std::env::var("DATABASE_URL").ok()),
        Err(e) => {
            eprintln!("✗ {}", e);
            return ExitCode::FAILURE;
        }
    };

    let min_level = config.logging.min_level().unwrap_or(logging::LogLevel::Info);
    logging::init_logger(min_level, config.logging.file.as_deref(), config.logging.timestamps);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logging::error(Component::System, None, &e.to_string());
            ExitCode::FAILURE
        }
    }
}
