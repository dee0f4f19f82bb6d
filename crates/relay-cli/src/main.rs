//! Run one relay session from the command line.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use chat_relay_core::observability::init_observability;
use chat_relay_core::prelude::*;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "chat-relay", about = "Stream a chat reply from an upstream provider")]
struct Args {
    /// Provider id: `gemini` or `openai`.
    #[arg(long, short, default_value = "openai")]
    provider: String,

    /// Optional system instruction.
    #[arg(long)]
    system: Option<String>,

    /// JSON file holding prior turns: `[{"role":"user","text":"..."}, ...]`.
    #[arg(long)]
    history: Option<PathBuf>,

    /// Print the normalized SSE frames instead of plain text.
    #[arg(long)]
    sse: bool,

    /// Use the non-streaming endpoint and print the whole reply.
    #[arg(long, conflicts_with = "sse")]
    one_shot: bool,

    /// The new user message.
    message: String,
}

fn load_env() {
    let _ = dotenvy::from_path(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(".env"));
    dotenvy::dotenv().ok();
}

fn load_history(path: &PathBuf) -> Result<Vec<Turn>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| format!("invalid history in {}: {e}", path.display()))
}

fn build_request(args: &Args) -> Result<RelayRequest, String> {
    let mut request = RelayRequest::new(args.provider.clone(), args.message.clone());
    if let Some(system) = &args.system {
        request = request.system_instruction(system.clone());
    }
    if let Some(path) = &args.history {
        for turn in load_history(path)? {
            request = request.turn(turn);
        }
    }
    Ok(request)
}

#[tokio::main]
async fn main() -> ExitCode {
    load_env();
    init_observability();
    let args = Args::parse();

    let request = match build_request(&args) {
        Ok(request) => request,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };
    let relay = match RelayConfig::from_env().and_then(Relay::new) {
        Ok(relay) => relay,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    if args.one_shot {
        return match relay.complete(request).await {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("relay error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let mut stream = relay.start_stream(request);
    tracing::debug!(session_id = %stream.session_id(), "session started");
    let mut stdout = std::io::stdout().lock();
    let mut failed = false;
    while let Some(event) = stream.next_event().await {
        let written = if args.sse {
            stdout.write_all(event.to_sse_frame().as_bytes())
        } else {
            match &event {
                RelayEvent::Fragment { text, .. } => stdout.write_all(text.as_bytes()),
                RelayEvent::Done => writeln!(stdout),
                RelayEvent::Error(failure) => {
                    eprintln!("\nrelay error [{}]: {}", failure.category(), failure.message());
                    Ok(())
                }
            }
        };
        failed |= matches!(event, RelayEvent::Error(_));
        if written.and_then(|_| stdout.flush()).is_err() {
            // Closed pipe: stop reading so the session tears down upstream.
            stream.abort_handle().abort();
            break;
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
