use std::io::{self, IsTerminal, Write};

use clap::Parser;
use scapedb::config::Config;
use scapedb::executor::Session;
use scapedb::storage::database::GlobalManager;
use scapedb::{logger, process_statement};

/// Reads `atty::is(atty::Stream::Stdin)` in the teacher's `main.rs`, but that
/// crate was never actually declared in its `Cargo.toml`. `IsTerminal` is
/// stdlib (stabilized well before this crate's `rust-version`) and gives the
/// same interactive/piped distinction without an undeclared dependency.
fn is_interactive() -> bool {
    io::stdin().is_terminal()
}

fn main() {
    let config = match Config::try_parse() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    logger::init();

    let data_root = config.data_root();
    let mut global = match GlobalManager::open(&data_root) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{}", logger::error_row(&e.to_string()));
            std::process::exit(1);
        }
    };

    if config.init {
        if let Err(e) = global.purge_all() {
            eprintln!("{}", logger::error_row(&e.to_string()));
            std::process::exit(1);
        }
    }

    let mut session = Session::new(config.batch, config.database.clone(), config.table.clone());

    let exit_code = match &config.filepath {
        Some(path) => run_batch_file(&mut global, &mut session, path),
        None => run_loop(&mut global, &mut session, config.batch),
    };

    global.shutdown();
    std::process::exit(exit_code);
}

fn run_batch_file(global: &mut GlobalManager, session: &mut Session, path: &std::path::Path) -> i32 {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", logger::error_row(&e.to_string()));
            return 1;
        }
    };
    for statement in contents.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        run_one(global, session, &format!("{statement};"));
    }
    0
}

fn run_loop(global: &mut GlobalManager, session: &mut Session, batch: bool) -> i32 {
    let interactive = is_interactive() && !batch;
    if interactive {
        println!("scapedb - single-node relational storage engine");
        println!("Type 'exit' to quit\n");
    }

    loop {
        if interactive {
            print!("scapedb> ");
            io::stdout().flush().ok();
        }

        let mut input = String::new();
        if io::stdin().read_line(&mut input).unwrap_or(0) == 0 {
            break;
        }
        let query = input.trim();
        if query.is_empty() {
            continue;
        }
        if interactive && query.eq_ignore_ascii_case("exit") {
            println!("Goodbye!");
            break;
        }

        run_one(global, session, query);
    }
    0
}

fn run_one(global: &mut GlobalManager, session: &mut Session, query: &str) {
    match process_statement(global, session, query) {
        Ok(output) => println!("{output}"),
        Err(e) => println!("{}", logger::error_row(&e.to_string())),
    }
}
