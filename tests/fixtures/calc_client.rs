//! Interactive calculator client driven by the end-to-end tests.
//!
//! Connects to the calculator server given by `--address <host> --port <port>`, then reads commands
//! from stdin, forwards them to the server and prints each response followed by a `>> ` prompt.

use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const HELP: &str = "\
Commands:
  block <op> <a> <b>       compute and wait for the result
  non-block <op> <a> <b>   submit a job and print its ticket
  get <ticket> nowait      fetch the result of a job, if finished
  get <ticket> wait <ms>   wait up to <ms> for the result of a job
  help                     print this help
  exit | quit              leave
Operations: add, sub, mult, div, concat, find";

fn parse_args() -> Result<(String, u16), String> {
    let mut address = None;
    let mut port = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--address" => address = args.next(),
            "--port" => port = args.next().and_then(|port| port.parse().ok()),
            other => return Err(format!("Unknown argument '{other}'")),
        }
    }
    match (address, port) {
        (Some(address), Some(port)) => Ok((address, port)),
        _ => Err("Usage: calc_client --address <host> --port <port>".to_owned()),
    }
}

fn prompt() -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(b">> ")?;
    stdout.flush()
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let (address, port) = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let stream = match TcpStream::connect((address.as_str(), port)).await {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("Failed to connect to tcp://{address}:{port}: {err}");
            std::process::exit(1);
        }
    };
    let (read, mut write) = stream.into_split();
    let mut responses = BufReader::new(read).lines();

    println!("Client started. Type 'help' for commands.");
    prompt()?;

    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    while let Some(command) = commands.next_line().await? {
        let command = command.trim();
        match command {
            "" => {}
            "help" => println!("{HELP}"),
            "exit" | "quit" => {
                println!("Bye.");
                return Ok(());
            }
            _ => {
                write.write_all(format!("{command}\n").as_bytes()).await?;
                match responses.next_line().await? {
                    Some(response) => println!("{response}"),
                    None => {
                        eprintln!("Server closed the connection");
                        std::process::exit(1);
                    }
                }
            }
        }
        prompt()?;
    }
    Ok(())
}
