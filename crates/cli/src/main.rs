//! `ask` — submit a request to a running `laskd` daemon from the command
//! line, over the same Unix-domain-socket protocol `laskd-server`'s
//! `ipc` module speaks.

use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;

use clap::{Parser, ValueEnum};
use console::style;
use laskd_protocol::{Caller, ExitCode, Provider, Request};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProviderArg {
    Claude,
    Codex,
    Gemini,
    Opencode,
    Droid,
}

impl From<ProviderArg> for Provider {
    fn from(value: ProviderArg) -> Self {
        match value {
            ProviderArg::Claude => Provider::Claude,
            ProviderArg::Codex => Provider::Codex,
            ProviderArg::Gemini => Provider::Gemini,
            ProviderArg::Opencode => Provider::Opencode,
            ProviderArg::Droid => Provider::Droid,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CallerArg {
    Claude,
    Codex,
    Droid,
}

impl From<CallerArg> for Caller {
    fn from(value: CallerArg) -> Self {
        match value {
            CallerArg::Claude => Caller::Claude,
            CallerArg::Codex => Caller::Codex,
            CallerArg::Droid => Caller::Droid,
        }
    }
}

/// Submit a prompt to an active laskd session and print its reply.
#[derive(Parser, Debug)]
#[command(name = "ask", version)]
struct Cli {
    /// Which interactive session to route to.
    #[arg(long, value_enum, default_value = "claude")]
    provider: ProviderArg,

    /// Project directory the session is bound to (default: current dir).
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Timeout in seconds; negative means unbounded.
    #[arg(long, default_value_t = 120.0)]
    timeout: f64,

    /// Identity to report to the completion notifier.
    #[arg(long, value_enum, default_value = "claude")]
    caller: CallerArg,

    /// Write the daemon's envelope to this path instead of just stdout.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Path to the daemon's Unix-domain socket (default: `$LASKD_DATA_DIR/laskd.sock`
    /// or `~/.laskd/laskd.sock`).
    #[arg(long, env = "LASKD_SOCKET_PATH")]
    socket: Option<PathBuf>,

    /// The message to send. Joined with spaces when given as multiple words.
    message: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Submit { request: Request },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Result { result: laskd_protocol::TaskResult },
    Error { message: String },
    Ack,
}

fn default_socket_path() -> PathBuf {
    let data_dir = std::env::var("LASKD_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")).join(".laskd"));
    data_dir.join("laskd.sock")
}

#[tokio::main]
async fn main() -> anyhow::Result<ProcessExitCode> {
    let cli = Cli::parse();

    if cli.message.is_empty() {
        eprintln!("{}", style("ask: no message given").red());
        return Ok(ProcessExitCode::from(1));
    }

    let work_dir = cli
        .work_dir
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
        .to_string_lossy()
        .to_string();

    let request = Request {
        req_id: laskd_protocol::make_req_id(),
        provider: cli.provider.into(),
        work_dir,
        message: cli.message.join(" "),
        timeout_sec: cli.timeout,
        caller: cli.caller.into(),
        output_path: cli.output.map(|p| p.to_string_lossy().to_string()),
        email_context: None,
    };

    let socket_path = cli.socket.unwrap_or_else(default_socket_path);
    let stream = match UnixStream::connect(&socket_path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", style(format!("ask: could not reach laskd at {}: {}", socket_path.display(), e)).red());
            return Ok(ProcessExitCode::from(1));
        }
    };

    let (read_half, mut write_half) = stream.into_split();
    let mut line = serde_json::to_string(&ClientMessage::Submit { request })?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;

    let mut lines = BufReader::new(read_half).lines();
    while let Some(raw) = lines.next_line().await? {
        if raw.trim().is_empty() {
            continue;
        }
        let message: ServerMessage = serde_json::from_str(&raw)?;
        match message {
            ServerMessage::Ack => continue,
            ServerMessage::Error { message } => {
                eprintln!("{}", style(format!("ask: {}", message)).red());
                return Ok(ProcessExitCode::from(1));
            }
            ServerMessage::Result { result } => {
                println!("{}", result.reply);
                return Ok(match result.exit_code {
                    ExitCode::Success => ProcessExitCode::from(0),
                    ExitCode::ConfigOrPaneError => ProcessExitCode::from(1),
                    ExitCode::Timeout => ProcessExitCode::from(2),
                });
            }
        }
    }

    eprintln!("{}", style("ask: connection closed before a result arrived").red());
    Ok(ProcessExitCode::from(1))
}
