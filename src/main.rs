//! stillwater: guided meditations from the command line.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stillwater::config::Config;
use stillwater::history::{self, SessionRecord};
use stillwater::meditation::{ChatSession, GuidanceLevel, MeditationConfig, ScriptGenerator, Technique};
use stillwater::speech::{KokoroPlatform, SpeechController, SpeechPlatform, VoiceName};
use stillwater::storage::FileStorage;
use stillwater::{MessagesClient, SpeechError};

#[derive(Parser, Debug)]
#[command(name = "stillwater", about = "Guided meditation scripts, chat and speech")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a guided meditation script
    Generate {
        /// What the meditation is about
        #[arg(short, long)]
        topic: String,

        #[arg(long, value_enum, default_value = "mindfulness")]
        technique: Technique,

        #[arg(short, long, value_enum, default_value = "balanced")]
        guidance: GuidanceLevel,

        /// Length in minutes
        #[arg(short, long, default_value = "10")]
        duration: NonZeroU32,

        /// Voice to speak with (defaults to the configured voice)
        #[arg(long, value_enum)]
        voice: Option<VoiceName>,

        /// Speak the script once generated
        #[arg(short, long)]
        speak: bool,

        /// Also write the script to this file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Speak an existing script file
    Speak {
        file: PathBuf,

        #[arg(long, value_enum)]
        voice: Option<VoiceName>,
    },

    /// Chat with the meditation guide (/reset starts over, /quit exits)
    Chat,

    /// List voices
    Voices,

    /// Print a report of past sessions
    Report,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Suppress noisy ort internals
    let filter = if args.verbose {
        EnvFilter::new("debug,ort=info")
    } else {
        EnvFilter::new("info,ort=warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref());
    config.validate()?;

    match args.command {
        Command::Generate {
            topic,
            technique,
            guidance,
            duration,
            voice,
            speak,
            out,
        } => {
            let meditation = MeditationConfig {
                topic,
                technique,
                guidance_level: guidance,
                duration_minutes: duration,
            };
            let voice = voice.unwrap_or(config.speech.voice);
            generate(&config, meditation, voice, speak, out).await?;
        }
        Command::Speak { file, voice } => {
            let script = std::fs::read_to_string(&file)?;
            let controller = speech_controller(&config)?;
            play(&controller, &script, voice.unwrap_or(config.speech.voice)).await?;
        }
        Command::Chat => chat(&config).await?,
        Command::Voices => voices(&config),
        Command::Report => {
            let storage = FileStorage::open(config.storage.resolved_path())?;
            println!("{}", history::generate_report(&storage));
        }
    }

    Ok(())
}

async fn generate(
    config: &Config,
    meditation: MeditationConfig,
    voice: VoiceName,
    speak: bool,
    out: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    // Start loading voices while the script is generated.
    let controller = if speak { Some(speech_controller(config)?) } else { None };

    let client = MessagesClient::new(&config.api)?;
    let generator = ScriptGenerator::new(&client, config.api.script_max_tokens);

    let t_gen = Instant::now();
    let script = generator.generate(&meditation).await?;
    let generation_ms = history::millis(t_gen.elapsed());

    println!("{script}");
    if let Some(path) = &out {
        std::fs::write(path, &script)?;
        info!("Script written to {}", path.display());
    }

    let mut playback_ms = 0;
    let mut completed = !speak;
    if let Some(controller) = &controller {
        let t_play = Instant::now();
        match play(controller, &script, voice).await {
            Ok(()) => completed = true,
            Err(SpeechError::Interrupted) => info!("Playback stopped"),
            Err(e) => warn!("Playback failed: {e}"),
        }
        playback_ms = history::millis(t_play.elapsed());
    }

    let record = SessionRecord {
        timestamp: history::now_timestamp(),
        topic: meditation.topic,
        technique: meditation.technique,
        guidance_level: meditation.guidance_level,
        duration_minutes: meditation.duration_minutes.get(),
        voice: speak.then_some(voice),
        script_chars: script.len(),
        generation_ms,
        playback_ms,
        completed,
    };
    match FileStorage::open(config.storage.resolved_path()) {
        Ok(mut storage) => {
            if let Err(e) = history::save_session(&mut storage, &record) {
                warn!("Failed to record session: {e}");
            }
        }
        Err(e) => warn!("Failed to open session storage: {e}"),
    }

    Ok(())
}

fn speech_controller(config: &Config) -> Result<SpeechController, SpeechError> {
    if !config.speech.enabled {
        return Err(SpeechError::Unsupported);
    }
    let platform = Arc::new(KokoroPlatform::new(&config.speech));
    let controller = SpeechController::new(platform.clone());
    platform.load_in_background();
    Ok(controller)
}

/// Speak until finished; Ctrl-C stops playback.
async fn play(controller: &SpeechController, script: &str, voice: VoiceName) -> Result<(), SpeechError> {
    tokio::select! {
        result = controller.speak_to_end(script, voice) => result,
        _ = tokio::signal::ctrl_c() => {
            controller.stop();
            Err(SpeechError::Interrupted)
        }
    }
}

async fn chat(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = MessagesClient::new(&config.api)?;
    let mut session = ChatSession::new(&client, config.api.chat_max_tokens);

    println!("Ask the meditation guide anything. /reset starts over, /quit exits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        match text {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                session.create_chat();
                println!("(new conversation)");
            }
            _ => match session.send_message(text).await {
                Ok(reply) => println!("\n{reply}\n"),
                Err(e) => eprintln!("error: {e}"),
            },
        }
    }

    Ok(())
}

fn voices(config: &Config) {
    println!("Voices:");
    for voice in VoiceName::ALL {
        let p = voice.profile();
        println!("  {voice:<10} {}  pitch {:.2}  rate {:.2}", p.lang, p.pitch, p.rate);
    }

    if !config.speech.enabled {
        return;
    }

    let platform = KokoroPlatform::new(&config.speech);
    match platform.load() {
        Ok(()) => {
            println!("\nKokoro voices:");
            for v in platform.voices() {
                println!("  {:<14} {}{}", v.name, v.lang, if v.default { " (default)" } else { "" });
            }
        }
        Err(e) => warn!("Kokoro voices unavailable: {e}"),
    }
}
