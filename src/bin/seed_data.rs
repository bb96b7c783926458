//! Create and seed the KPI SQLite database with deterministic demo rows.

use clap::Parser;
use kpi_assistant::datastore::SqliteStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(about = "Create and seed the KPI assistant database")]
struct Args {
    /// Path of the SQLite database to create or top up
    #[arg(long, default_value = "kpi_assistant.db")]
    db_path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let store = SqliteStore::open(&args.db_path)?;
    store.init_schema()?;
    println!("✅ Schema ready at {}", args.db_path.display());

    store.seed_demo_data()?;
    println!("✅ Demo data seeded");
    println!(
        "Done at {}. Point the server at it with DB_PATH={}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        args.db_path.display()
    );
    Ok(())
}
