//! Command-line command sender
//!
//! Drops a command file into the orchestrator's queue and waits for the
//! response. Exit codes: 0 accepted, 2 invalid state, 3 unknown verb,
//! 1 for local/transport problems.
//!
//! Usage: hightrade_cmd <verb> [args...]
//!        hightrade_cmd status
//!        hightrade_cmd interval 5

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use std::time::{Duration, Instant};
use uuid::Uuid;

use hightrade::command::{Command, CommandQueue, CommandResponse, CommandVerb};
use hightrade::config::AppConfig;

/// Info verbs answer fast; mutators may wait for a sleep boundary
fn response_timeout(verb: CommandVerb) -> Duration {
    match verb {
        CommandVerb::Status | CommandVerb::Portfolio | CommandVerb::Defcon => {
            Duration::from_secs(5)
        }
        _ => Duration::from_secs(30),
    }
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(verb_raw) = args.next() else {
        print_usage();
        std::process::exit(1);
    };
    let command_args: Vec<String> = args.collect();

    let Some(verb) = CommandVerb::parse(&verb_raw) else {
        eprintln!("unknown verb: {}", verb_raw);
        print_usage();
        std::process::exit(3);
    };

    let config = AppConfig::load().context("loading configuration")?;
    let queue = CommandQueue::new(&Path::new(&config.orchestrator.data_dir).join("commands"))?;

    let command = Command {
        id: Uuid::new_v4().to_string(),
        verb: verb.as_str().to_string(),
        args: command_args,
        received_at: Utc::now(),
    };
    queue.drop_command(&command)?;
    println!("sent: {}", verb.as_str());

    match wait_for_response(&queue, &command.id, response_timeout(verb)) {
        Some(response) => {
            print_response(&response);
            std::process::exit(response.code);
        }
        None => {
            println!("no response yet; the orchestrator will process it on its next tick");
            Ok(())
        }
    }
}

fn wait_for_response(
    queue: &CommandQueue,
    command_id: &str,
    timeout: Duration,
) -> Option<CommandResponse> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if let Some(response) = queue.take_response(command_id) {
            return Some(response);
        }
        std::thread::sleep(Duration::from_millis(300));
    }
    None
}

fn print_response(response: &CommandResponse) {
    let marker = if response.ok { "ok" } else { "error" };
    println!("[{}] {}", marker, response.message);
    if let Some(data) = &response.data {
        match serde_json::to_string_pretty(data) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{}", data),
        }
    }
}

fn print_usage() {
    eprintln!("usage: hightrade_cmd <verb> [args...]");
    eprintln!();
    eprintln!("  status | portfolio | defcon      read-only queries");
    eprintln!("  hold | resume                    pause / unpause trading");
    eprintln!("  yes | no                         answer the pending decision");
    eprintln!("  refresh                          run the next cycle now");
    eprintln!("  mode <disabled|semi_auto|full_auto>");
    eprintln!("  interval <minutes>");
    eprintln!("  estop | shutdown");
}
