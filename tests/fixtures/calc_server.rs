//! Calculator server driven by the end-to-end tests.
//!
//! Listens on `127.0.0.1` (an ephemeral port unless `--port <port>` is given) and announces its
//! endpoint on stdout, unless started with `--silent`. Every request is a single line, answered
//! by a single line:
//!
//! - `block <op> <a> <b>` computes right away.
//! - `non-block <op> <a> <b>` answers with a ticket. The job completes after `--job-delay-ms`.
//! - `get <ticket> nowait` and `get <ticket> wait <ms>` fetch the result of a ticket.
//!
//! Operations are `add`, `sub`, `mult` and `div` on integers, `concat` on strings of at most
//! 16 characters and `find` reporting the position of a substring.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const MAX_STRING_LENGTH: usize = 16;

struct Args {
    port: u16,
    silent: bool,
    job_delay: Duration,
}

fn parse_args() -> Result<Args, String> {
    let mut parsed = Args {
        port: 0,
        silent: false,
        job_delay: Duration::from_millis(1000),
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                parsed.port = args
                    .next()
                    .and_then(|port| port.parse().ok())
                    .ok_or("--port expects a port number")?;
            }
            "--job-delay-ms" => {
                parsed.job_delay = args
                    .next()
                    .and_then(|ms| ms.parse().ok())
                    .map(Duration::from_millis)
                    .ok_or("--job-delay-ms expects milliseconds")?;
            }
            "--silent" => parsed.silent = true,
            other => return Err(format!("Unknown argument '{other}'")),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    let addr = listener.local_addr()?;
    if !args.silent {
        println!("Server running at tcp://{addr}");
    }

    let jobs = Jobs::new(args.job_delay);
    loop {
        let (stream, peer) = listener.accept().await?;
        let jobs = jobs.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(stream, jobs).await {
                eprintln!("Connection from {peer} failed: {err}");
            }
        });
    }
}

async fn serve(stream: TcpStream, jobs: Jobs) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(request) = lines.next_line().await? {
        let mut response = handle(&request, &jobs).await;
        response.push('\n');
        write.write_all(response.as_bytes()).await?;
    }
    Ok(())
}

async fn handle(request: &str, jobs: &Jobs) -> String {
    let words: Vec<&str> = request.split_whitespace().collect();
    match words.as_slice() {
        ["block", op, rest @ ..] => evaluate(op, rest),
        ["non-block", op, rest @ ..] => {
            let ticket = jobs.submit(evaluate(op, rest));
            format!("IPC Info: [NOT_FINISHED] ticket={ticket}")
        }
        ["get", ticket, mode @ ..] => {
            let Ok(ticket) = ticket.parse::<u64>() else {
                return format!("IPC Error: [ERROR_INVALID_ARGUMENT] Invalid ticket '{ticket}'");
            };
            let wait = match mode {
                ["nowait"] => Duration::ZERO,
                ["wait", ms] => match ms.parse() {
                    Ok(ms) => Duration::from_millis(ms),
                    Err(_) => return format!("IPC Error: Invalid timeout '{ms}'"),
                },
                other => return format!("IPC Error: Invalid wait mode '{}'", other.join(" ")),
            };
            jobs.get(ticket, wait).await
        }
        _ => format!("IPC Error: [ERROR_UNKNOWN_COMMAND] '{request}'"),
    }
}

fn evaluate(op: &str, operands: &[&str]) -> String {
    let [a, b] = operands else {
        return usage(op);
    };
    match op {
        "add" | "sub" | "mult" | "div" => {
            let (Ok(a), Ok(b)) = (a.parse::<i64>(), b.parse::<i64>()) else {
                return usage(op);
            };
            let result = match op {
                "add" => a.checked_add(b),
                "sub" => a.checked_sub(b),
                "mult" => a.checked_mul(b),
                _ if b == 0 => return "IPC Error: [ERROR_DIV_BY_ZERO] div by 0".to_owned(),
                _ => a.checked_div(b),
            };
            match result {
                Some(result) => format!("Result: Int={result}"),
                None => "IPC Error: [ERROR_OVERFLOW] Integer overflow".to_owned(),
            }
        }
        "concat" => {
            if a.chars().count() > MAX_STRING_LENGTH || b.chars().count() > MAX_STRING_LENGTH {
                return format!(
                    "IPC Error: [ERROR_INVALID_ARGUMENT] String too long (max {MAX_STRING_LENGTH})"
                );
            }
            format!("Result: Str={a}{b}")
        }
        "find" => match a.find(*b) {
            Some(pos) => format!("Result: Pos={pos}"),
            None => "Result: Pos=-1".to_owned(),
        },
        _ => format!("IPC Error: [ERROR_UNKNOWN_OPERATION] '{op}'"),
    }
}

fn usage(op: &str) -> String {
    format!("Usage: block {op} a b")
}

#[derive(Clone)]
struct Jobs {
    next_ticket: Arc<AtomicU64>,
    results: Arc<Mutex<HashMap<u64, watch::Receiver<Option<String>>>>>,
    delay: Duration,
}

impl Jobs {
    fn new(delay: Duration) -> Self {
        Self {
            next_ticket: Arc::new(AtomicU64::new(1)),
            results: Arc::default(),
            delay,
        }
    }

    fn submit(&self, result: String) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ticket, receiver);

        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sender.send_replace(Some(result));
        });
        ticket
    }

    async fn get(&self, ticket: u64, wait: Duration) -> String {
        let receiver = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ticket)
            .cloned();
        let Some(mut receiver) = receiver else {
            return format!("IPC Error: [ERROR_UNKNOWN_TICKET] ticket={ticket}");
        };

        let finished = tokio::time::timeout(wait, receiver.wait_for(Option::is_some)).await;
        match finished {
            Ok(Ok(result)) => result.clone().unwrap_or_default(),
            Ok(Err(_)) | Err(_) => format!("IPC Info: [NOT_FINISHED] ticket={ticket}"),
        }
    }
}
