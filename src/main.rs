use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info};

use probador_voz::config::{CommandConfig, Config, DEFAULT_CONFIG_PATH};
use probador_voz::recognition::{LineEngine, RecognitionBackend, StreamingBackend};
use probador_voz::stats::{self, SharedStats};
use probador_voz::tts::{self, LogSpeech, SpeechSink};
use probador_voz::{
    CommandAction, CommandDefinition, CommandDispatcher, CommandRegistry, CommandScope,
    ListeningSession, SessionEvent,
};

#[derive(Parser)]
#[command(name = "probador-voz", about = "Voice commands for the virtual fitting room")]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for commands (one utterance per line on stdin)
    Listen {
        /// Record the microphone in chunks and transcribe them remotely
        #[arg(long)]
        chunked: bool,
    },
    /// Show which command a phrase would trigger
    Match {
        #[arg(required = true)]
        phrase: Vec<String>,
    },
    /// List the configured commands
    Commands,
}

#[hotpath::main]
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("probador_voz=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(async_main());
    // a pending stdin read would otherwise hold shutdown open
    runtime.shutdown_timeout(Duration::from_millis(200));
    result
}

async fn async_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::Listen { chunked } => run_listen(config, chunked).await,
        Command::Match { phrase } => run_match(config, &phrase.join(" ")),
        Command::Commands => {
            for command in &config.commands {
                println!("{:<16} {}", command.id, command.patterns.join(" | "));
            }
            Ok(())
        }
    }
}

fn register_commands(scope: &mut CommandScope, commands: &[CommandConfig]) {
    for command in commands {
        let id = command.id.clone();
        let reply = command.reply.clone();
        let action = CommandAction::sync(move || {
            let now = Local::now().format("%H:%M:%S");
            match &reply {
                Some(reply) => println!("[{}] {}", now, reply),
                None => println!("[{}] {}", now, id),
            }
            Ok(())
        });

        let mut definition = CommandDefinition::new(command.patterns.clone(), action);
        if let Some(ack) = &command.acknowledgment {
            definition = definition.with_acknowledgment(ack.clone());
        }
        let full_id = scope.register(&command.id, definition);
        debug!("Registered {}", full_id);
    }
}

fn build_backend(
    chunked: bool,
    config: &Config,
    stats: &SharedStats,
) -> anyhow::Result<Arc<dyn RecognitionBackend>> {
    if !chunked {
        eprintln!("Type what you would say, one phrase per line. Ctrl+C or end of input stops.\n");
        return Ok(Arc::new(StreamingBackend::new(Arc::new(LineEngine::stdin()))));
    }

    #[cfg(feature = "mic")]
    {
        use probador_voz::capture::MicRecorder;
        use probador_voz::recognition::ChunkedBackend;
        use probador_voz::transcriber::HttpTranscriber;

        let transcriber =
            HttpTranscriber::with_stats(config.transcription.clone(), Some(Arc::clone(stats)));
        eprintln!("Recording {:?} chunks. Press Ctrl+C to stop.\n", config.session.chunk_duration());
        return Ok(Arc::new(
            ChunkedBackend::new(Arc::new(MicRecorder::new()), Arc::new(transcriber), &config.session)
                .with_stats(Arc::clone(stats)),
        ));
    }

    #[cfg(not(feature = "mic"))]
    {
        let _ = (config, stats);
        anyhow::bail!("chunked mode needs microphone support; rebuild with `--features mic`")
    }
}

async fn run_listen(config: Config, chunked: bool) -> anyhow::Result<()> {
    let stats = stats::new_shared();
    let registry = CommandRegistry::new();
    let mut scope = registry.scope("cli");
    register_commands(&mut scope, &config.commands);
    if registry.is_empty() {
        eprintln!("No [[commands]] configured; nothing will match.");
    }

    let speech: Arc<dyn SpeechSink> = Arc::from(tts::from_config(&config.speech));
    let action_delay = config.dispatch.action_delay();
    let dispatcher = Arc::new(
        CommandDispatcher::new(registry.clone(), speech, config.dispatch.clone())
            .with_stats(Arc::clone(&stats)),
    );
    let backend = build_backend(chunked, &config, &stats)?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let session = ListeningSession::new(backend, dispatcher, config.session.clone(), event_tx);

    let (stop_tx, stop_rx) = flume::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("installing Ctrl+C handler")?;

    session.start().await.context("starting to listen")?;

    loop {
        tokio::select! {
            _ = stop_rx.recv_async() => break,
            event = event_rx.recv() => match event {
                Some(SessionEvent::Final(text)) => eprintln!("> {}", text),
                Some(SessionEvent::Partial(text)) => debug!("~ {}", text),
                Some(SessionEvent::CommandMatched(found)) => {
                    info!("{} ({:.1})", found.id, found.score);
                }
                Some(SessionEvent::Error { message, fatal: true }) => {
                    eprintln!("Session ended: {}", message);
                }
                Some(SessionEvent::Error { message, .. }) => eprintln!("Warning: {}", message),
                Some(SessionEvent::Stopped) | None => break,
                Some(_) => {}
            },
        }
    }

    session.stop().await;
    // let the last command's action run before exiting
    tokio::time::sleep(action_delay * 2).await;
    drop(scope);

    let summary = stats.lock().map(|s| s.summary()).unwrap_or_default();
    eprintln!("\n{}", summary);
    Ok(())
}

fn run_match(config: Config, phrase: &str) -> anyhow::Result<()> {
    let registry = CommandRegistry::new();
    let mut scope = registry.scope("cli");
    register_commands(&mut scope, &config.commands);

    let min_score = config.dispatch.min_score;
    let dispatcher = CommandDispatcher::new(registry, Arc::new(LogSpeech), config.dispatch);
    match dispatcher.best_match(phrase) {
        Some(found) => {
            let verdict = if found.score > min_score { "fires" } else { "below threshold" };
            println!(
                "{} via {:?}: {:.1} ({})",
                found.id, found.pattern, found.score, verdict
            );
        }
        None => println!("No command for {:?}", phrase),
    }
    Ok(())
}
