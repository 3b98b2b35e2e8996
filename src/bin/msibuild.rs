use clap::Parser;
use msiquery::{Database, OpenMode};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "msibuild")]
#[command(about = "Build or modify an installer database from IDT files, transforms and SQL", long_about = None)]
struct Args {
    /// Database file to build
    database: PathBuf,

    /// Start from an empty database instead of opening an existing one
    #[arg(long)]
    create: bool,

    /// IDT files to import, in order
    #[arg(short = 'i', long = "import")]
    imports: Vec<PathBuf>,

    /// Transforms to apply after the imports
    #[arg(short = 't', long = "transform")]
    transforms: Vec<PathBuf>,

    /// Statements to run last
    #[arg(short = 'q', long = "query")]
    queries: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("MSIQUERY_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mode = if args.create { OpenMode::Create } else { OpenMode::Transact };
    let mut db = Database::open(&args.database, mode)?;

    for path in &args.imports {
        db.import(path)?;
        info!(file = %path.display(), "imported");
    }
    for path in &args.transforms {
        db.apply_transform(path)?;
        info!(transform = %path.display(), "applied");
    }
    for sql in &args.queries {
        db.execute_sql(sql)?;
    }

    db.commit()?;
    eprintln!(
        "Wrote {} ({} imports, {} transforms, {} statements)",
        args.database.display(),
        args.imports.len(),
        args.transforms.len(),
        args.queries.len()
    );
    Ok(())
}
