use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use crossbeam_channel::Receiver;
use scribe_input::router::{ChannelRouter, Router};
use scribe_input::{server, Config, Event, Input};
use tracing::{error, info};

/// Accepts Scribe log entries and writes them to stdout as events.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "SCRIBE_INPUT_CONFIG")]
    config: PathBuf,

    /// Log filter, in `tracing_subscriber::EnvFilter` syntax.
    #[arg(long, default_value = "info", env = "SCRIBE_INPUT_LOG")]
    log: String,

    #[arg(long, value_enum, default_value_t = Output::Json)]
    output: Output,

    /// Events buffered between the server and stdout.
    #[arg(long, default_value_t = 1024)]
    buffer: usize,

    /// How long a batch waits for room in the buffer before the client is
    /// told to try later, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    admission_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Output {
    /// One JSON object per line.
    Json,
    /// Fluentd Message Mode arrays in MessagePack.
    Msgpack,
}

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(args.log.as_str())
        .init();

    if let Err(e) = run(&args) {
        error!("{e}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_toml(&fs::read_to_string(&args.config)?)?;

    let (data_tx, data_rx) = crossbeam_channel::bounded::<Event>(args.buffer);
    let router = ChannelRouter::new(data_tx, Duration::from_millis(args.admission_timeout_ms));
    let input = server::Input::bind(&config, router)?;

    // SIGINT and SIGTERM start a graceful drain.
    let shutdown = input.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("shutdown requested");
        shutdown.trigger();
    })?;

    forward(input, &data_rx, args.output, io::stdout().lock())
}

/// Runs `input` and writes every event it routes to `out`, until the input
/// stops and the last event is written.
fn forward<R, W>(
    input: server::Input<R>,
    data_rx: &Receiver<Event>,
    output: Output,
    mut out: W,
) -> Result<(), Box<dyn std::error::Error>>
where
    R: Router + 'static,
    W: Write,
{
    let in_thread = thread::spawn(move || input.run());
    for event in data_rx {
        match output {
            Output::Json => {
                serde_json::to_writer(&mut out, &event)?;
                out.write_all(b"\n")?;
            }
            Output::Msgpack => out.write_all(&event.to_msgpack()?)?,
        }
        out.flush()?;
    }

    match in_thread.join() {
        Ok(result) => Ok(result?),
        Err(_) => Err("server thread panicked".into()),
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    use scribe_input::router::ChannelRouter;
    use scribe_input::scribe::{Client, LogEntry, ResultCode};
    use scribe_input::{server, Config, Event};

    use super::{forward, Output};

    #[test]
    fn forwarding_ends_after_shutdown() {
        let mut config = Config::new(0);
        config.bind = "127.0.0.1".into();
        let (data_tx, data_rx) = crossbeam_channel::bounded(16);
        let router = ChannelRouter::new(data_tx, Duration::from_secs(1)).with_fixed_time(10);
        let input = server::Input::bind(&config, router).unwrap();
        let addr = input.local_addr().unwrap();
        let shutdown = input.shutdown_handle();

        let client = thread::spawn(move || {
            let mut client = Client::new(TcpStream::connect(addr).unwrap());
            let code = client
                .log(&[LogEntry {
                    category: b"tag1",
                    message: b"aiueo",
                }])
                .unwrap();
            shutdown.trigger();
            code
        });

        let mut out = Vec::new();
        forward(input, &data_rx, Output::Json, &mut out).unwrap();
        assert_eq!(client.join().unwrap(), ResultCode::Ok);
        let events: Vec<Event> = serde_json::Deserializer::from_slice(&out)
            .into_iter::<Event>()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, "tag1");
        assert_eq!(events[0].time, 10);
        assert_eq!(events[0].record["message"], "aiueo");
    }
}
