use clap::{Args as ClapArgs, Parser, Subcommand};
use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use endless_noise::config::{StreamConfig, CONFIG};
use endless_noise::logging::init_logging;
use endless_noise::{open_default, NoiseColor};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

const VOLUME_STEP: f32 = 0.1;

/// Stream endless, seamlessly crossfaded colored noise
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play noise on the default output device until `q` or Ctrl-C
    Play(PlayArgs),
    /// Generate a default config file and exit
    GenerateConfig(ConfigArgs),
}

#[derive(ClapArgs)]
struct PlayArgs {
    /// Config file to use instead of config.toml
    #[arg(long)]
    config: Option<PathBuf>,
    /// white, pink, brown or blue
    #[arg(long)]
    color: Option<NoiseColor>,
    /// Target volume between 0 and 1
    #[arg(long)]
    volume: Option<f32>,
    /// Length of each synthesized block in seconds
    #[arg(long)]
    block_seconds: Option<f32>,
    /// Crossfade length in seconds
    #[arg(long)]
    crossfade_seconds: Option<f32>,
    /// Seed for reproducible noise
    #[arg(long)]
    seed: Option<u64>,
    /// Synthesize on the control thread instead of a background worker
    #[arg(long, default_value_t = false)]
    inline: bool,
}

#[derive(ClapArgs)]
struct ConfigArgs {
    /// Output path for the generated configuration
    #[arg(long, default_value = "config.toml")]
    out: String,
}

enum Control {
    Toggle,
    CycleColor,
    Volume(f32),
    Status,
    Quit,
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Play(args) => play(args),
        Commands::GenerateConfig(cfg) => {
            StreamConfig::generate_default(&cfg.out)?;
            println!("Generated default config at {}", cfg.out);
            Ok(())
        }
    }
}

fn stream_config(args: &PlayArgs) -> anyhow::Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => StreamConfig::load(path)?,
        None => (*CONFIG).clone(),
    };
    if let Some(color) = args.color {
        config.color = color;
    }
    if let Some(volume) = args.volume {
        config.target_volume = volume;
    }
    if let Some(secs) = args.block_seconds {
        config.block_seconds = secs;
    }
    if let Some(secs) = args.crossfade_seconds {
        config.crossfade_seconds = secs;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.inline {
        config.background_synthesis = false;
    }
    config.validate()?;
    Ok(config)
}

fn play(args: PlayArgs) -> anyhow::Result<()> {
    let config = stream_config(&args)?;
    let mut engine = open_default(&config)?;
    let mut volume = config.target_volume;
    let mut color = config.color;

    engine.toggle()?;
    println!("Streaming {} noise ({})", color, color.description());
    println!("Controls: p = play/stop, c = next color, +/- = volume, s = status, q = quit");

    let (tx, rx) = unbounded::<Control>();
    ctrlc::set_handler({
        let tx = tx.clone();
        move || {
            let _ = tx.send(Control::Quit);
        }
    })?;
    spawn_input_thread(tx);

    loop {
        let control = match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(control) => control,
            Err(RecvTimeoutError::Timeout) => {
                if let Some(err) = engine.take_error() {
                    eprintln!("Playback stopped: {err}");
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match control {
            Control::Toggle => match engine.toggle() {
                Ok(state) => println!("{state:?}"),
                Err(e) => eprintln!("Toggle failed: {e}"),
            },
            Control::CycleColor => {
                color = color.next();
                match engine.set_color(color) {
                    Ok(_) => println!("{} noise ({})", color, color.description()),
                    Err(e) => eprintln!("Color change failed: {e}"),
                }
            }
            Control::Volume(delta) => {
                volume = (volume + delta).clamp(0.0, 1.0);
                match engine.set_volume(volume) {
                    Ok(()) => println!("Volume {:.0}%", volume * 100.0),
                    Err(e) => eprintln!("Volume change failed: {e}"),
                }
            }
            Control::Status => println!("{}", engine.status_json()?),
            Control::Quit => break,
        }
    }

    engine.shutdown();
    Ok(())
}

fn spawn_input_thread(tx: Sender<Control>) {
    std::thread::spawn(move || read_controls(std::io::stdin().lock(), &tx));
}

/// Forward keyboard controls until quit, end of input or a read error.
fn read_controls<R: BufRead>(mut input: R, tx: &Sender<Control>) {
    loop {
        let mut buf = String::new();
        match input.read_line(&mut buf) {
            // Input closed: Ctrl-C is the only way out now.
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("stdin unreadable, keyboard controls disabled: {e}");
                break;
            }
        }
        let control = match buf.trim() {
            "p" => Control::Toggle,
            "c" => Control::CycleColor,
            "+" => Control::Volume(VOLUME_STEP),
            "-" => Control::Volume(-VOLUME_STEP),
            "s" => Control::Status,
            "q" => Control::Quit,
            _ => {
                println!("p = play/stop, c = next color, +/- = volume, s = status, q = quit");
                continue;
            }
        };
        let quit = matches!(control, Control::Quit);
        if tx.send(control).is_err() || quit {
            break;
        }
    }
}
