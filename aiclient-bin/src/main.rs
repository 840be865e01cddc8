use std::io::{self, Write};
use std::path::PathBuf;

use aiclient_core::{
    Config, OpenAiClient, StreamListener,
    model::{
        AudioFile, AudioFormat, ChatMessage, ChatRequest, CompletionChunk, CompletionRequest,
        TranscriptionRequest,
    },
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "aiclient CLI smoke tool", long_about = None)]
struct Cli {
    /// JSON or TOML config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print each chunk as raw JSON instead of its text
    #[arg(long, global = true)]
    json: bool,
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Override the batching window in milliseconds
    #[arg(long, global = true)]
    throttle_ms: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a completion through callbacks
    Complete {
        #[arg(long)]
        model: String,
        #[arg(short, long, help = "Prompt text")]
        prompt: String,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Stream a completion as a pull stream
    StreamComplete {
        #[arg(long)]
        model: String,
        #[arg(short, long, help = "Prompt text")]
        prompt: String,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Stream a chat completion (prints deltas live)
    Chat {
        #[arg(long)]
        model: String,
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long, help = "Optional system prompt")]
        system: Option<String>,
    },
    /// List available models
    Models,
    /// Upload a file (multipart) and print the stored record
    Upload {
        path: PathBuf,
        #[arg(long, default_value = "fine-tune")]
        purpose: String,
    },
    /// Transcribe an audio file, or translate it to English with --translate
    Transcribe {
        path: PathBuf,
        #[arg(long, default_value = "whisper-1")]
        model: String,
        #[arg(long, help = "ISO-639-1 language of the audio")]
        language: Option<String>,
        #[arg(long)]
        translate: bool,
    },
}

fn file_name(path: &std::path::Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("no usable file name in {}", path.display()))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .init();
}

fn print_chunk<T: Serialize>(chunk: &T, text: &str, json: bool) {
    if json {
        match serde_json::to_string(chunk) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("[encode error: {e}]"),
        }
    } else {
        print!("{text}");
        io::stdout().flush().ok();
    }
}

fn completion_request(model: String, prompt: String, max_tokens: Option<u32>) -> CompletionRequest {
    let mut req = CompletionRequest::new(model, prompt);
    req.max_tokens = max_tokens;
    req
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut cfg = match &cli.config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(ms) = cli.throttle_ms {
        cfg.stream.throttle_ms = ms;
    }
    debug!(base_url = %cfg.api.base_url, throttle_ms = cfg.stream.throttle_ms, "config loaded");
    let client = OpenAiClient::from_config(&cfg)?;
    let json = cli.json;

    match cli.command {
        Commands::Complete {
            model,
            prompt,
            max_tokens,
        } => {
            let listener = StreamListener::new(
                move |batch: Vec<CompletionChunk>| {
                    for chunk in &batch {
                        print_chunk(chunk, chunk.first_choice(), json);
                    }
                    Ok(())
                },
                || println!(),
            );
            let streaming = client
                .streaming_completion(completion_request(model, prompt, max_tokens), listener)?;
            streaming.start()?;
            streaming.wait_for_shutdown().await;
        }
        Commands::StreamComplete {
            model,
            prompt,
            max_tokens,
        } => {
            let mut stream = client.completion_stream(completion_request(model, prompt, max_tokens))?;
            while let Some(batch) = stream.next().await {
                for chunk in &batch {
                    print_chunk(chunk, chunk.first_choice(), json);
                }
            }
            println!();
        }
        Commands::Chat {
            model,
            message,
            system,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(message));
            let mut stream = client.chat_completion_stream(ChatRequest::new(model, messages))?;
            while let Some(batch) = stream.next().await {
                for chunk in &batch {
                    print_chunk(chunk, chunk.first_choice(), json);
                }
            }
            println!();
        }
        Commands::Models => {
            let resp = client.models().await?;
            for model in resp.data {
                if json {
                    println!("{}", serde_json::to_string(&model)?);
                } else {
                    println!("{}\t{}", model.id, model.owned_by);
                }
            }
        }
        Commands::Upload { path, purpose } => {
            let content =
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let file = client.upload_file(&file_name(&path)?, content, &purpose).await?;
            if json {
                println!("{}", serde_json::to_string(&file)?);
            } else {
                println!("{}\t{}\t{} bytes", file.id, file.filename, file.bytes);
            }
        }
        Commands::Transcribe {
            path,
            model,
            language,
            translate,
        } => {
            let filename = file_name(&path)?;
            let format = AudioFormat::from_filename(&filename)
                .with_context(|| format!("unsupported audio type: {filename}"))?;
            let data = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let mut request = TranscriptionRequest::new(
                model,
                AudioFile {
                    filename,
                    data,
                    format,
                },
            );
            request.language = language;
            let resp = if translate {
                client.translation(request).await?
            } else {
                client.transcription(request).await?
            };
            println!("{}", resp.text);
        }
    }

    Ok(())
}
