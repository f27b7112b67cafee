//! Interactive console over an in-memory testnet.
//!
//! Run: `cargo run --example console -- --nodes 20`

use std::io::{self, BufRead, Write};

use clap::Parser;
use kadmium::command::Command;
use kadmium::Testnet;
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of nodes in the testnet
    #[arg(short, long, default_value_t = 20)]
    nodes: usize,
    /// Index of the node commands run on
    #[arg(short, long, default_value_t = 0)]
    node: usize,
    /// Print debug logs
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt().with_max_level(level).init();

    println!("Starting a testnet of {} nodes...", cli.nodes);
    let testnet = Testnet::new(cli.nodes).expect("testnet failed to start");
    let dht = testnet
        .nodes
        .get(cli.node)
        .expect("node index out of range");

    println!("Ready, type help for commands\n");

    let stdin = io::stdin();
    prompt();

    for line in stdin.lock().lines() {
        let line = line.expect("failed to read stdin");

        if matches!(line.trim(), "quit" | "exit") {
            break;
        }

        match line.parse::<Command>().and_then(|command| command.execute(dht)) {
            Ok(output) => println!("{}\n", output),
            Err(error) => println!("error: {}\n", error),
        }

        prompt();
    }

    dht.shutdown();
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}
