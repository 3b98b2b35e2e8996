use clap::Parser;
use msiquery::database::{FORCE_CODEPAGE, SUMMARY_INFORMATION};
use msiquery::{Database, OpenMode};
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "msidump")]
#[command(about = "Export the tables of an installer database as IDT files", long_about = None)]
struct Args {
    /// Database file to dump
    database: PathBuf,

    /// Output directory
    #[arg(short = 'o', long, default_value = ".")]
    output: PathBuf,

    /// Tables to export (default: all tables plus summary information and codepage)
    tables: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("MSIQUERY_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut db = Database::open(&args.database, OpenMode::ReadOnly)?;
    fs::create_dir_all(&args.output)?;

    let tables = if args.tables.is_empty() {
        let mut all = db.table_names()?;
        all.push(SUMMARY_INFORMATION.to_string());
        all.push(FORCE_CODEPAGE.to_string());
        all
    } else {
        args.tables
    };

    for table in &tables {
        let file = format!("{table}.idt");
        db.export_to_file(table, &args.output, &file)?;
        info!(table = %table, "exported");
        eprintln!("-- {file}");
    }
    eprintln!("Exported {} tables to {}", tables.len(), args.output.display());
    Ok(())
}
