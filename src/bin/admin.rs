use clap::Parser;
use std::{env::VarError, error::Error, path::PathBuf, time::Duration};

use sono::cleanup;
use sono::db;

/// Maintenance tasks for the sono database and upload directory.
#[derive(Debug, Parser)]
#[clap(version, author, about)]
struct Opts {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[derive(Debug, Parser)]
enum SubCommand {
    /// Apply pending database migrations
    Migrate {
        /// defaults to DATABASE_URL env variable if not provided
        #[clap(short, long)]
        database_url: Option<String>,
    },
    /// Remove uploaded files that no audio record points to
    Sweep {
        /// defaults to DATABASE_URL env variable if not provided
        #[clap(short, long)]
        database_url: Option<String>,

        #[clap(short, long, default_value = "uploads")]
        upload_root: PathBuf,

        /// files younger than this are left alone
        #[clap(long, default_value_t = 60)]
        min_age_minutes: u64,

        /// only report what would be removed
        #[clap(long)]
        dry_run: bool,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    match Opts::parse().cmd {
        SubCommand::Migrate { database_url } => migrate(database_url),
        SubCommand::Sweep {
            database_url,
            upload_root,
            min_age_minutes,
            dry_run,
        } => sweep(database_url, upload_root, min_age_minutes, dry_run),
    }
}

fn migrate(database_url: Option<String>) -> Result<(), Box<dyn Error>> {
    let db_url = get_db_url(database_url)?;
    let mut conn = db::connect(&db_url)?;
    db::run_migrations(&mut conn)?;
    Ok(())
}

fn sweep(
    database_url: Option<String>,
    upload_root: PathBuf,
    min_age_minutes: u64,
    dry_run: bool,
) -> Result<(), Box<dyn Error>> {
    let db_url = get_db_url(database_url)?;
    let mut conn = db::connect(&db_url)?;
    let report = cleanup::sweep_orphans(
        &mut conn,
        &upload_root,
        Duration::from_secs(min_age_minutes * 60),
        dry_run,
    )?;
    for path in &report.orphans {
        println!("{path}");
    }
    Ok(())
}

fn get_db_url(database_url: Option<String>) -> Result<String, Box<dyn Error>> {
    match database_url {
        Some(x) => Ok(x),
        None => match std::env::var("DATABASE_URL") {
            Ok(x) => Ok(x),
            Err(VarError::NotPresent) => Err("DATABASE_URL env var not found".into()),
            Err(VarError::NotUnicode(_)) => Err("DATABASE_URL env var not valid unicode".into()),
        },
    }
}
