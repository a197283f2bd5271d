//! fleet-grep: distributed log search
//!
//! - `fleet-grep serve`: run a log server over a local log file or directory
//! - `fleet-grep query`: send a query to every configured server and print
//!   per-server and total match counts

use fleet_grep::config::{ClientConfig, Config, Mode};
use fleet_grep::fanout::FanOut;
use fleet_grep::runtime;
use std::io::{self, BufRead, Write};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging. Diagnostics go to stderr so the client report on
    // stdout stays readable.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match config.mode {
        Mode::Serve(server) => {
            info!(
                listen = %server.listen,
                log_source = %server.log_source.display(),
                runtime = ?server.runtime,
                matcher = ?server.matcher,
                "Starting fleet-grep server"
            );
            runtime::run(&server)?;
        }
        Mode::Query(client) => run_client(client)?,
    }

    Ok(())
}

fn run_client(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.servers.is_empty() {
        warn!("No servers configured");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let fanout = FanOut::new().with_timeout(config.timeout);

    match config.query {
        Some(ref query) => {
            search(&rt, &fanout, &config, query);
            Ok(())
        }
        None => menu(&rt, &fanout, &config).map_err(Into::into),
    }
}

fn search(rt: &tokio::runtime::Runtime, fanout: &FanOut, config: &ClientConfig, query: &str) {
    println!("fetching logs from all the servers ...");
    let report = rt.block_on(fanout.broadcast(&config.servers, query.to_string()));
    print!("{}", report.render(config.print_logs));
}

/// Interactive loop: list servers, search, exit.
fn menu(rt: &tokio::runtime::Runtime, fanout: &FanOut, config: &ClientConfig) -> io::Result<()> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut line = String::new();

    loop {
        println!("-------------------------------");
        println!("1. Display current servers");
        println!("2. Search logs");
        println!("3. Exit");
        print!("choose one of the following options: ");
        io::stdout().flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(());
        }

        match line.trim() {
            "1" => {
                println!("servers:");
                for (i, server) in config.servers.iter().enumerate() {
                    println!("{}: {}", i + 1, server);
                }
            }
            "2" => {
                print!("Enter search query (Ex: search ['query1', 'query2']): ");
                io::stdout().flush()?;
                line.clear();
                if input.read_line(&mut line)? == 0 {
                    return Ok(());
                }
                let query = line.trim_end_matches(['\r', '\n']);
                search(rt, fanout, config, query);
            }
            "3" => return Ok(()),
            other => println!("invalid option {other}."),
        }
    }
}
