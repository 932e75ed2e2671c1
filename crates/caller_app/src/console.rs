//! Line-oriented control surface on stdin.

use std::sync::Arc;

use request_pipeline::generator::RequestGenerator;
use request_pipeline::processor::{DEFAULT_RECENT_LIMIT, Processor};
use snafu::Snafu;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Most records a single `enqueue` publishes.
pub const MAX_ENQUEUE: usize = 100;

pub const HELP: &str = "\
commands:
  interval <secs>   seconds between bursts (values below 1 become 1)
  burst <count>     concurrent calls per burst (values below 1 become 1)
  target <url>      destination of every call
  pause | resume    stop or restart issuing bursts
  status            current generator state as JSON
  enqueue [n]       publish n work records to the queue (default 1, at most 100)
  process           record one unit of work inline
  recent [n]        most recent work records (default 5)
  help | quit";

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Interval(i64),
    Burst(i64),
    Target(String),
    Pause,
    Resume,
    Status,
    Enqueue(usize),
    Process,
    Recent(usize),
    Help,
    Quit,
}

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum ParseError {
    #[snafu(display("Empty command"))]
    Empty,

    #[snafu(display("Unknown command '{}'", command))]
    Unknown { command: String },

    #[snafu(display("'{}' needs an argument", command))]
    MissingArgument { command: &'static str },

    #[snafu(display("'{}' is not a valid number for '{}'", value, command))]
    InvalidNumber { command: &'static str, value: String },
}

fn number<T: std::str::FromStr>(command: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidNumber {
        command,
        value: value.to_string(),
    })
}

pub fn parse(line: &str) -> Result<Command, ParseError> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Err(ParseError::Empty);
    };
    let argument = words.next();

    let required = |name: &'static str| argument.ok_or(ParseError::MissingArgument { command: name });

    match command.to_ascii_lowercase().as_str() {
        "interval" => Ok(Command::Interval(number("interval", required("interval")?)?)),
        "burst" => Ok(Command::Burst(number("burst", required("burst")?)?)),
        "target" => Ok(Command::Target(required("target")?.to_string())),
        "pause" => Ok(Command::Pause),
        "resume" => Ok(Command::Resume),
        "status" => Ok(Command::Status),
        "enqueue" => Ok(Command::Enqueue(argument.map_or(Ok(1), |v| number("enqueue", v))?)),
        "process" => Ok(Command::Process),
        "recent" => Ok(Command::Recent(
            argument.map_or(Ok(DEFAULT_RECENT_LIMIT), |v| number("recent", v))?,
        )),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(ParseError::Unknown {
            command: other.to_string(),
        }),
    }
}

pub struct Console<S> {
    generator: Arc<RequestGenerator<S>>,
    processor: Processor,
    queue: String,
}

impl<S> Console<S> {
    pub fn new(generator: Arc<RequestGenerator<S>>, processor: Processor, queue: String) -> Self {
        Self {
            generator,
            processor,
            queue,
        }
    }

    /// Reads commands until `quit` or shutdown. End of input leaves the process running.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => return,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match parse(&line) {
                    Ok(Command::Quit) => return,
                    Ok(command) => println!("{}", self.execute(command).await),
                    Err(error) => println!("{}\n{}", error, HELP),
                },
                Ok(None) => {
                    debug!("Console input closed");
                    shutdown.cancelled().await;
                    return;
                }
                Err(error) => {
                    warn!(%error, "Failed to read console input");
                    shutdown.cancelled().await;
                    return;
                }
            }
        }
    }

    pub async fn execute(&self, command: Command) -> String {
        match command {
            Command::Interval(seconds) => {
                format!("interval = {}s", self.generator.set_interval(seconds))
            }
            Command::Burst(count) => format!("burst = {}", self.generator.set_burst(count)),
            Command::Target(url) => match self.generator.set_target(&url) {
                Ok(()) => format!("target = {}", url.trim()),
                Err(error) => error.to_string(),
            },
            Command::Pause => {
                self.generator.pause();
                "paused".to_string()
            }
            Command::Resume => {
                self.generator.resume();
                "resumed".to_string()
            }
            Command::Status => serde_json::to_string_pretty(&self.generator.status())
                .unwrap_or_else(|error| error.to_string()),
            Command::Enqueue(count) => {
                let mut accepted = Vec::new();
                for _ in 0..count.min(MAX_ENQUEUE) {
                    match self.processor.process_via_queue(&self.queue).await {
                        Ok(id) => accepted.push(id.to_string()),
                        Err(error) => return format!("{} (accepted: {:?})", error, accepted),
                    }
                }
                format!("accepted: {:?}", accepted)
            }
            Command::Process => match self.processor.process_inline().await {
                Ok(id) => format!("processed {}", id),
                Err(error) => error.to_string(),
            },
            Command::Recent(limit) => match self.processor.recent(limit).await {
                Ok(records) => serde_json::to_string_pretty(&records)
                    .unwrap_or_else(|error| error.to_string()),
                Err(error) => error.to_string(),
            },
            Command::Help => HELP.to_string(),
            Command::Quit => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use request_pipeline::generator::GeneratorSettings;
    use request_pipeline::generator::reqwest_integration::ReqwestService;
    use request_pipeline::processor::ProcessorSettings;
    use request_pipeline::queue::QueuePublisher;
    use request_pipeline::queue::memory::MemoryBroker;
    use request_pipeline::store::MemoryStore;

    use super::*;

    fn console(broker: &MemoryBroker) -> Console<ReqwestService> {
        let generator =
            RequestGenerator::new(ReqwestService::new(), GeneratorSettings::default()).unwrap();
        let processor = Processor::new(
            Arc::new(MemoryStore::new()),
            QueuePublisher::new(Arc::new(broker.channel())),
            ProcessorSettings::default(),
        );
        Console::new(Arc::new(generator), processor, "ProcessQueue".to_string())
    }

    #[test]
    fn parses_commands_and_arguments() {
        assert_eq!(parse("interval 10"), Ok(Command::Interval(10)));
        assert_eq!(parse("  BURST   -2 "), Ok(Command::Burst(-2)));
        assert_eq!(
            parse("target http://localhost:9002/process"),
            Ok(Command::Target("http://localhost:9002/process".to_string()))
        );
        assert_eq!(parse("enqueue"), Ok(Command::Enqueue(1)));
        assert_eq!(parse("recent 3"), Ok(Command::Recent(3)));
        assert_eq!(parse("recent"), Ok(Command::Recent(5)));
        assert_eq!(parse("exit"), Ok(Command::Quit));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(parse("   "), Err(ParseError::Empty));
        assert_eq!(
            parse("interval"),
            Err(ParseError::MissingArgument { command: "interval" })
        );
        assert_eq!(
            parse("burst many"),
            Err(ParseError::InvalidNumber {
                command: "burst",
                value: "many".to_string()
            })
        );
        assert!(matches!(parse("reboot"), Err(ParseError::Unknown { .. })));
    }

    #[tokio::test]
    async fn commands_reconfigure_the_generator() {
        let console = console(&MemoryBroker::new());

        assert_eq!(console.execute(Command::Interval(0)).await, "interval = 1s");
        assert_eq!(console.execute(Command::Burst(4)).await, "burst = 4");
        console.execute(Command::Pause).await;
        console
            .execute(Command::Target("http://localhost:1/x".to_string()))
            .await;

        let status = console.generator.status();
        assert_eq!(status.interval_seconds, 1);
        assert_eq!(status.burst_count, 4);
        assert_eq!(status.target_url, "http://localhost:1/x");
        assert!(status.paused);
    }

    #[tokio::test]
    async fn empty_target_is_refused() {
        let console = console(&MemoryBroker::new());

        let reply = console.execute(Command::Target(" ".to_string())).await;

        assert!(!reply.starts_with("target ="));
        assert_eq!(console.generator.status().target_url, "http://processor-api:9002/process");
    }

    #[tokio::test]
    async fn enqueue_publishes_records() {
        let broker = MemoryBroker::new();
        let console = console(&broker);

        let reply = console.execute(Command::Enqueue(3)).await;

        assert!(reply.starts_with("accepted"));
        assert_eq!(broker.ready_count("ProcessQueue"), 3);
    }

    #[tokio::test]
    async fn enqueue_count_is_capped() {
        let broker = MemoryBroker::new();
        let console = console(&broker);

        assert_eq!(
            parse("enqueue 18446744073709551615"),
            Ok(Command::Enqueue(usize::MAX))
        );
        let reply = console.execute(Command::Enqueue(usize::MAX)).await;

        assert!(reply.starts_with("accepted"));
        assert_eq!(broker.ready_count("ProcessQueue"), MAX_ENQUEUE);
    }
}
