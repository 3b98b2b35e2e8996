use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use comfy_table::{Cell, Table as ComfyTable, presets::UTF8_FULL};
use config::{Config, Environment, File};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde::Deserialize;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use msiquery::core::summary_info::property_name;
use msiquery::{ColumnInfoKind, Database, Field, MsiError, OpenMode, Statement, parse_statement};

/// How many bytes of a stream cell are shown.
const STREAM_PREVIEW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Mode {
    Readonly,
    Transact,
    Direct,
    Create,
}

impl From<Mode> for OpenMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Readonly => Self::ReadOnly,
            Mode::Transact => Self::Transact,
            Mode::Direct => Self::Direct,
            Mode::Create => Self::Create,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Output {
    Table,
    Json,
}

/// Interactive SQL shell for installer databases
#[derive(Parser, Debug)]
#[command(name = "msiquery")]
#[command(about = "Query and edit Windows Installer databases", long_about = None)]
struct Args {
    /// Database file (in-memory when omitted)
    database: Option<PathBuf>,

    /// Open mode
    #[arg(short = 'm', long, value_enum)]
    mode: Option<Mode>,

    /// Run a statement and exit (repeatable)
    #[arg(short = 'c', long = "command")]
    commands: Vec<String>,

    /// Result format
    #[arg(short = 'o', long, value_enum)]
    output: Option<Output>,
}

/// Shell configuration
#[derive(Debug, Deserialize)]
struct ShellConfig {
    #[serde(default)]
    database: Option<PathBuf>,
    #[serde(default = "default_mode")]
    mode: Mode,
    #[serde(default = "default_history")]
    history: bool,
    #[serde(default = "default_max_rows")]
    max_rows: usize,
    #[serde(default = "default_output")]
    output: Output,
}

fn default_mode() -> Mode { Mode::Transact }
fn default_history() -> bool { true }
fn default_max_rows() -> usize { 1000 }
fn default_output() -> Output { Output::Table }

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            database: None,
            mode: default_mode(),
            history: default_history(),
            max_rows: default_max_rows(),
            output: default_output(),
        }
    }
}

impl ShellConfig {
    /// Load configuration with priority: CLI args > ENV > config file > defaults
    fn load(args: &Args) -> Self {
        let mut config_paths = vec![PathBuf::from("./msiquery.toml")];
        if let Some(dir) = dirs::config_dir() {
            config_paths.push(dir.join("msiquery").join("msiquery.toml"));
        }

        let mut builder = Config::builder();
        if let Some(path) = config_paths.iter().find(|p| p.exists()) {
            builder = builder.add_source(File::from(path.as_path()));
            debug!(path = %path.display(), "loaded config");
        }

        // MSIQUERY_MODE, MSIQUERY_MAX_ROWS, ...
        builder = builder.add_source(Environment::with_prefix("MSIQUERY").try_parsing(true));

        let base = match builder.build().and_then(|c| c.try_deserialize::<Self>()) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "ignoring invalid configuration");
                Self::default()
            }
        };

        Self {
            database: args.database.clone().or(base.database),
            mode: args.mode.unwrap_or(base.mode),
            history: base.history,
            max_rows: base.max_rows,
            output: args.output.unwrap_or(base.output),
        }
    }
}

fn field_text(field: &Field) -> String {
    match field {
        Field::Stream(s) => {
            let bytes = s.bytes();
            let shown = &bytes[..bytes.len().min(STREAM_PREVIEW)];
            let more = if bytes.len() > STREAM_PREVIEW { "..." } else { "" };
            format!("{}{more} ({} bytes)", hex::encode(shown), bytes.len())
        }
        other => other.to_string(),
    }
}

fn field_json(field: &Field) -> serde_json::Value {
    match field {
        Field::Null => serde_json::Value::Null,
        Field::Int(i) => serde_json::Value::from(*i),
        Field::Str(s) => serde_json::Value::from(s.as_str()),
        Field::Stream(s) => serde_json::Value::from(hex::encode(s.bytes())),
    }
}

struct Shell {
    db: Database,
    config: ShellConfig,
}

impl Shell {
    fn open(config: ShellConfig) -> Result<Self, MsiError> {
        let db = match &config.database {
            Some(path) => Database::open(path, config.mode.into())?,
            None => Database::new(),
        };
        Ok(Self { db, config })
    }

    fn run_sql(&mut self, sql: &str) -> Result<(), MsiError> {
        let is_select = matches!(parse_statement(sql)?, Statement::Select { .. });
        let max_rows = self.config.max_rows;
        let output = self.config.output;

        let mut query = self.db.open_query(sql)?;
        query.execute(None)?;
        if !is_select {
            query.close()?;
            println!("OK");
            return Ok(());
        }

        let names = query.column_info(ColumnInfoKind::Names)?;
        let columns: Vec<String> = names.values().map(ToString::to_string).collect();
        let mut rows = Vec::new();
        let mut total = 0;
        while let Some(rec) = query.fetch()? {
            total += 1;
            if rows.len() < max_rows {
                rows.push(rec);
            }
        }
        query.close()?;

        match output {
            Output::Table => {
                let mut table = ComfyTable::new();
                table.load_preset(UTF8_FULL);
                table.set_header(columns.iter().map(Cell::new));
                for rec in &rows {
                    table.add_row(rec.values().map(|f| Cell::new(field_text(f))));
                }
                println!("{table}");
            }
            Output::Json => {
                let items: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|rec| {
                        let object = columns
                            .iter()
                            .cloned()
                            .zip(rec.values().map(field_json))
                            .collect::<serde_json::Map<_, _>>();
                        serde_json::Value::Object(object)
                    })
                    .collect();
                let text = serde_json::to_string_pretty(&items).map_err(|e| MsiError::Serialization(e.to_string()))?;
                println!("{text}");
            }
        }
        if total > rows.len() {
            println!("({total} rows, first {} shown)", rows.len());
        } else {
            println!("({total} rows)");
        }
        Ok(())
    }

    fn list_tables(&mut self) -> Result<(), MsiError> {
        let mut table = ComfyTable::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Table", "Rows", "Persistent"]);
        for name in self.db.table_names()? {
            let rows = self.db.load_table(&name)?.row_count();
            let persistent = self.db.is_table_persistent(&name)?;
            table.add_row(vec![Cell::new(&name), Cell::new(rows), Cell::new(persistent)]);
        }
        println!("{table}");
        Ok(())
    }

    fn describe(&mut self, name: &str) -> Result<(), MsiError> {
        let mut query = self.db.open_query(&format!("SELECT * FROM `{name}`"))?;
        let names = query.column_info(ColumnInfoKind::Names)?;
        let types = query.column_info(ColumnInfoKind::Types)?;
        query.close()?;
        drop(query);
        let keys = self.db.primary_keys(name)?;
        let keys: Vec<String> = keys.values().map(ToString::to_string).collect();

        let mut table = ComfyTable::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Column", "Type", "Key"]);
        for (col, ty) in names.values().zip(types.values()) {
            let col = col.to_string();
            let key = if keys.contains(&col) { "yes" } else { "" };
            table.add_row(vec![Cell::new(&col), Cell::new(ty), Cell::new(key)]);
        }
        println!("{table}");
        Ok(())
    }

    fn summary(&self) -> Result<(), MsiError> {
        let info = self.db.summary_info()?;
        let mut table = ComfyTable::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Id", "Property", "Value"]);
        for (pid, value) in info.properties() {
            table.add_row(vec![Cell::new(pid), Cell::new(property_name(pid)), Cell::new(value)]);
        }
        println!("{table}");
        Ok(())
    }

    /// Handles one input line; returns `false` when the shell should exit.
    fn handle(&mut self, line: &str) -> bool {
        let result = match line {
            "\\q" | "\\quit" => return false,
            "\\t" => self.list_tables(),
            "\\s" => self.summary(),
            "\\commit" => self.db.commit().map(|()| println!("Committed")),
            "\\?" | "\\h" | "\\help" => {
                print_help();
                Ok(())
            }
            _ if line.starts_with("\\d ") => self.describe(line[3..].trim()),
            _ if line.starts_with('\\') => {
                println!("Unknown meta-command: {line}. Use \\? for help.");
                Ok(())
            }
            sql => self.run_sql(sql.trim_end_matches(';')),
        };
        if let Err(e) = result {
            eprintln!("ERROR: {e}");
        }
        true
    }
}

fn print_help() {
    println!("Meta-commands:");
    println!("  \\t            - List tables");
    println!("  \\d <table>    - Describe table");
    println!("  \\s            - Show summary information");
    println!("  \\commit       - Commit changes");
    println!("  \\q            - Quit");
    println!("\nSQL: SELECT, INSERT INTO, UPDATE, DELETE FROM, CREATE TABLE, DROP TABLE");
}

fn history_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".msiquery_history"))
}

fn repl(shell: &mut Shell) -> Result<(), Box<dyn std::error::Error>> {
    let mut rl = DefaultEditor::new()?;
    let history = if shell.config.history { history_path() } else { None };
    if let Some(ref path) = history {
        if let Err(e) = rl.load_history(path) {
            debug!(error = %e, "no history loaded");
        }
    }

    let label = shell
        .config
        .database
        .as_deref()
        .and_then(Path::file_name)
        .map_or_else(|| "memory".to_string(), |n| n.to_string_lossy().into_owned());
    println!("msiquery {} - {label}. Type \\? for help.", env!("CARGO_PKG_VERSION"));

    loop {
        match rl.readline(&format!("{label}> ")) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = rl.add_history_entry(line) {
                    debug!(error = %e, "history entry dropped");
                }
                if !shell.handle(line) {
                    break;
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }

    if let Some(ref path) = history {
        if let Err(e) = rl.save_history(path) {
            warn!(error = %e, "could not save history");
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("MSIQUERY_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = ShellConfig::load(&args);
    let mut shell = Shell::open(config)?;

    if args.commands.is_empty() {
        return repl(&mut shell);
    }
    for command in &args.commands {
        shell.run_sql(command.trim().trim_end_matches(';'))?;
    }
    Ok(())
}
