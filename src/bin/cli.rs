//! RookDB interactive client
//!
//! A line-oriented REPL over the engine. SQL statements end with `;` and may
//! span lines; client meta-commands start with a dot and are handled here,
//! not by the SQL engine.

use std::path::PathBuf;
use std::process;

use clap::Parser as ClapParser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use rookdb::config::StorageConfig;
use rookdb::executor::{QueryResult, RookEngine};
use rookdb::storage::Tuple;

/// RookDB - a teaching-grade relational database engine.
#[derive(ClapParser, Debug)]
#[command(name = "rookdb", version)]
struct Cli {
    /// Data directory (one subdirectory per database).
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Buffer pool size in pages.
    #[arg(long, default_value_t = 256)]
    pool_size: usize,

    /// Execute statements non-interactively and exit (can be repeated).
    #[arg(short, long = "exec")]
    exec: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = StorageConfig {
        data_dir: cli.data_dir,
        buffer_pool_pages: cli.pool_size,
        ..Default::default()
    };

    let mut engine = match RookEngine::open(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to open database: {}", e);
            process::exit(1);
        }
    };

    let code = if cli.exec.is_empty() {
        run_repl(&mut engine)
    } else {
        run_exec_mode(&mut engine, &cli.exec)
    };

    if let Err(e) = engine.close() {
        eprintln!("Shutdown error: {}", e);
        process::exit(1);
    }
    process::exit(code);
}

fn run_exec_mode(engine: &mut RookEngine, statements: &[String]) -> i32 {
    for sql in statements {
        match engine.execute_sql(sql) {
            Ok(result) => print_result(&result),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    }
    0
}

fn run_repl(engine: &mut RookEngine) -> i32 {
    println!("RookDB v{}", env!("CARGO_PKG_VERSION"));
    println!("Type '.help' for help, '.quit' to exit.\n");

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Failed to initialize line editor: {}", e);
            return 1;
        }
    };

    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() { "rookdb> " } else { "   ...> " };
        match rl.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                if buffer.is_empty() && trimmed.starts_with('.') {
                    let _ = rl.add_history_entry(trimmed);
                    if !handle_meta_command(engine, trimmed) {
                        break;
                    }
                    continue;
                }

                buffer.push_str(&line);
                buffer.push('\n');

                if trimmed.ends_with(';') {
                    let sql = std::mem::take(&mut buffer);
                    let _ = rl.add_history_entry(sql.trim());
                    run_sql(engine, &sql);
                }
            }
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
                println!();
            }
            Err(ReadlineError::Eof) => {
                println!("Bye!");
                break;
            }
            Err(e) => {
                eprintln!("Readline error: {}", e);
                break;
            }
        }
    }
    0
}

fn run_sql(engine: &mut RookEngine, sql: &str) {
    match engine.execute_sql(sql) {
        Ok(result) => print_result(&result),
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.is_fatal() {
                eprintln!("Unrecoverable failure, shutting down.");
                process::exit(1);
            }
        }
    }
}

/// Handle a leading-dot command; returns false to exit the REPL.
fn handle_meta_command(engine: &mut RookEngine, command: &str) -> bool {
    let mut parts = command.split_whitespace();
    match parts.next() {
        Some(".help") => print_help(),
        Some(".quit") | Some(".exit") => {
            println!("Goodbye!");
            return false;
        }
        Some(".tables") => run_sql(engine, "SHOW TABLES;"),
        Some(".schema") => match parts.next() {
            Some(table) => run_sql(engine, &format!("SHOW COLUMNS FROM {};", table)),
            None => eprintln!("Usage: .schema <table>"),
        },
        Some(".read") => match parts.next() {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(script) => run_sql(engine, &script),
                Err(e) => eprintln!("Cannot read '{}': {}", path, e),
            },
            None => eprintln!("Usage: .read <path.sql>"),
        },
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Type '.help' for available commands.");
        }
        None => {}
    }
    true
}

fn print_help() {
    println!(
        r#"
Commands:
  .help              Show this help message
  .quit              Exit RookDB
  .tables            List all tables
  .schema <table>    Show table columns
  .read <path.sql>   Execute statements from a file

SQL statements end with a semicolon and may span multiple lines:
  CREATE TABLE students (student_id INT PRIMARY KEY, name VARCHAR(100));
  INSERT INTO students VALUES (1, 'Alice'), (2, 'Bob');
  SELECT * FROM students WHERE student_id = 1;
  EXPLAIN SELECT * FROM students WHERE student_id = 1;
"#
    );
}

fn print_result(result: &QueryResult) {
    if let Some(message) = &result.message {
        println!("{}", message);
        return;
    }
    if result.columns.is_empty() && result.rows.is_empty() {
        return;
    }
    print!("{}", format_table(&result.columns, &result.rows));
}

/// Render rows in an ASCII grid.
fn format_table(columns: &[String], rows: &[Tuple]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for row in rows {
        for (i, value) in row.values().iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(value.to_string().len());
            }
        }
    }

    let separator = format!(
        "+{}+\n",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );

    let mut out = String::new();
    out.push_str(&separator);
    let header = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!(" {:^width$} ", c, width = *w))
        .collect::<Vec<_>>()
        .join("|");
    out.push_str(&format!("|{}|\n", header));
    out.push_str(&separator);

    for row in rows {
        let line = row
            .values()
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!(" {:>width$} ", v.to_string(), width = *w))
            .collect::<Vec<_>>()
            .join("|");
        out.push_str(&format!("|{}|\n", line));
    }
    if !rows.is_empty() {
        out.push_str(&separator);
    }
    out.push_str(&format!("{} row(s) returned\n", rows.len()));
    out
}
