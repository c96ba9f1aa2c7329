use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use vrobot::config::Config;
use vrobot::machine::{
    spawn_operator, AutoOperator, ConsoleOperator, Controller, Fleet, OperationRecord,
    OperatorHandle,
};
use vrobot::{vlog, Result, TaskId};

/// Bound on waiting for an operation when decisions may wait indefinitely.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(24 * 60 * 60);
/// Slack on top of the decision timeout for the device calls themselves.
const DEVICE_SLACK: Duration = Duration::from_secs(30);

/// vrobot - queue-orchestrated robot cell controller
#[derive(Parser, Debug)]
#[command(name = "vrobot")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    VROBOT_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.vrobot/vrobot.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (defaults to ~/.vrobot/vrobot.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Print finished operations as JSON
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Ask which machine to bring online, then initialize it
    Init {
        /// Queue to run on (defaults to the first configured queue)
        #[arg(short, long)]
        queue: Option<String>,

        /// Machine to pick when answering unattended
        #[arg(short, long)]
        machine: Option<String>,

        /// Answer the confirmation automatically
        #[arg(short, long)]
        yes: bool,
    },

    /// Restart every machine in parallel
    Restart {
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Initialize unattended, then switch automatic reading on or off
    AutoRead {
        state: Toggle,

        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Run a full unattended session across two queues
    Demo,

    /// List configured queues
    Queues,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        self == Toggle::On
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    vrobot::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if cli.debug {
        vlog!("vrobot starting (debug mode enabled)");
    } else {
        vlog!("vrobot starting");
    }

    match cli.command.clone() {
        Command::Queues => run_queues(&config, cli.json),
        command => {
            let rt = tokio::runtime::Runtime::new()?;
            let records = rt.block_on(run_operation(command, &config))?;
            report(&records, cli.json)?;
            // The process exits non-zero if any operation failed.
            for record in &records {
                record.status.to_result()?;
            }
            Ok(())
        }
    }
}

fn run_queues(config: &Config, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config.queues)?);
    } else {
        for queue in &config.queues {
            println!("{}", queue);
        }
    }
    Ok(())
}

async fn run_operation(command: Command, config: &Config) -> Result<Vec<OperationRecord>> {
    let fleet = Fleet::simulated(&config.machines)?;
    let (controller, requests) = Controller::start(config, fleet)?;
    let first_queue = config.queues[0].clone();
    let wait = wait_bound(config);

    let auto = |machine: Option<&str>| {
        let operator = AutoOperator::new(&config.confirm_answer);
        match machine {
            Some(name) => operator.with_machine(name),
            None => operator,
        }
    };

    let (operator, tasks): (OperatorHandle, Vec<TaskId>) = match command {
        Command::Init {
            queue,
            machine,
            yes,
        } => {
            let operator = if yes {
                spawn_operator(
                    auto(machine.as_deref()),
                    requests,
                    controller.orchestrator().clone(),
                )?
            } else {
                spawn_operator(
                    ConsoleOperator::stdio(),
                    requests,
                    controller.orchestrator().clone(),
                )?
            };
            let queue = queue.unwrap_or(first_queue);
            (operator, vec![controller.initialize(&queue)?])
        }
        Command::Restart { queue } => {
            let operator = spawn_operator(auto(None), requests, controller.orchestrator().clone())?;
            let queue = queue.unwrap_or(first_queue);
            (operator, vec![controller.restart(&queue)?])
        }
        Command::AutoRead { state, queue } => {
            let operator = spawn_operator(auto(None), requests, controller.orchestrator().clone())?;
            let queue = queue.unwrap_or(first_queue);
            let init = controller.initialize(&queue)?;
            controller.wait_for(init, wait).await?;
            (
                operator,
                vec![init, controller.set_automatic_read(&queue, state.enabled())?],
            )
        }
        Command::Demo => {
            let operator = spawn_operator(auto(None), requests, controller.orchestrator().clone())?;
            let tasks = run_demo(&controller, config, wait).await?;
            (operator, tasks)
        }
        Command::Queues => (
            spawn_operator(auto(None), requests, controller.orchestrator().clone())?,
            Vec::new(),
        ),
    };

    let mut records = Vec::with_capacity(tasks.len());
    for task in tasks {
        records.push(controller.wait_for(task, wait).await?);
    }

    controller.shutdown();
    operator.join();
    Ok(records)
}

/// init on the first queue, then auto-read on alongside a restart on the
/// second queue, then auto-read off and uninitialize.
async fn run_demo(controller: &Controller, config: &Config, wait: Duration) -> Result<Vec<TaskId>> {
    let a = config.queues[0].as_str();
    let b = config.queues.get(1).map(String::as_str).unwrap_or(a);

    let init = controller.initialize(a)?;
    controller.wait_for(init, wait).await?;

    let read_on = controller.set_automatic_read(a, true)?;
    let restart = controller.restart(b)?;
    controller.wait_for(read_on, wait).await?;
    controller.wait_for(restart, wait).await?;

    let read_off = controller.set_automatic_read(a, false)?;
    controller.wait_for(read_off, wait).await?;
    let uninit = controller.uninitialize(a)?;

    Ok(vec![init, read_on, restart, read_off, uninit])
}

fn wait_bound(config: &Config) -> Duration {
    match config.decision_timeout() {
        Some(timeout) => timeout + DEVICE_SLACK,
        None => UNBOUNDED_WAIT,
    }
}

fn report(records: &[OperationRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }
    for record in records {
        let outcome = if record.successful() {
            "ok".to_string()
        } else {
            record
                .failures()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "{:<22} queue={} status={} {}",
            format!("{:?}", record.handler),
            record.queue,
            record.status,
            outcome
        );
    }
    Ok(())
}
