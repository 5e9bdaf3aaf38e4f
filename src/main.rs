use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Result};
use parking_lot::RwLock;
use sunrise_alarm::server::{self, AppState};
use sunrise_alarm::*;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    strip: StripArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, ValueEnum, Debug)]
enum Backend {
    /// Keep frames in memory (dry run)
    Memory,
    /// WS2812 strip on the Raspberry Pi SPI bus
    Spi,
}

#[derive(Args, Debug)]
struct StripArgs {
    /// Device driving the strip
    #[arg(long, value_enum, default_value_t = Backend::Memory, global = true)]
    backend: Backend,
    /// Number of LEDs on the strip
    #[arg(long, default_value_t = 380, global = true)]
    leds: usize,
    /// GPIO pin of the data line
    #[arg(long, default_value_t = 18, global = true)]
    gpio: u8,
    /// Baseline brightness (0-255)
    #[arg(long, default_value_t = 255, global = true)]
    brightness: u8,
    /// Seconds each sunrise step is held
    #[arg(long, default_value_t = 120, global = true)]
    step_hold: u64,
    /// Minutes full brightness is held after the sunrise
    #[arg(long, default_value_t = 20, global = true)]
    full_hold: u64,
    /// Milliseconds between cancellation checks
    #[arg(long, default_value_t = 1000, global = true)]
    poll_ms: u64,
    /// Number of trailing LEDs used for the rain overlay
    #[arg(long, default_value_t = 20, global = true)]
    rain_leds: usize,
    /// Skip the weather lookup
    #[arg(long, global = true)]
    no_weather: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and the HTTP API
    Serve {
        /// Address the HTTP API listens on
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        listen: SocketAddr,
        /// File the weekly schedule is stored in
        #[arg(short, long, default_value = "schedules.json")]
        schedule: PathBuf,
        /// Seconds between schedule checks
        #[arg(short, long, default_value_t = 5)]
        tick: u64,
    },
    /// Run the diagnostic suite (red fill, red scan, clear)
    Test,
    /// Run the sunrise alarm now
    Alarm,
    /// Turn all LEDs off
    Clear,
    /// Fill the strip with one color
    Fill {
        /// Red value (0-255)
        #[arg(short, long, default_value_t = 255)]
        red: u8,
        /// Green value (0-255)
        #[arg(short, long, default_value_t = 255)]
        green: u8,
        /// Blue value (0-255)
        #[arg(short, long, default_value_t = 255)]
        blue: u8,
    },
    /// Light each LED in turn
    Scan {
        /// Red value (0-255)
        #[arg(short, long, default_value_t = 255)]
        red: u8,
        /// Green value (0-255)
        #[arg(short, long, default_value_t = 0)]
        green: u8,
        /// Blue value (0-255)
        #[arg(short, long, default_value_t = 0)]
        blue: u8,
    },
    /// Step through brightness levels on white
    Ramp {
        /// Levels to step through, ascending
        #[arg(short, long, value_delimiter = ',', default_values_t = vec![25u8, 128, 255])]
        levels: Vec<u8>,
    },
}

impl StripArgs {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            device: DeviceConfig {
                gpio_pin: self.gpio,
                led_count: self.leds,
                brightness: self.brightness,
                ..DeviceConfig::default()
            },
            sunrise_step_hold: Duration::from_secs(self.step_hold),
            sunrise_full_hold: Duration::from_secs(self.full_hold * 60),
            poll_interval: Duration::from_millis(self.poll_ms),
            rain_pixels: self.rain_leds,
            ..EngineConfig::default()
        }
    }

    fn device_kind(&self) -> DeviceKind {
        match self.backend {
            Backend::Memory => DeviceKind::Memory,
            Backend::Spi => DeviceKind::Spi,
        }
    }

    fn rain_source(&self) -> Arc<dyn RainSource> {
        if self.no_weather {
            return Arc::new(NoRain);
        }
        match NoaaForecast::with_default_endpoints() {
            Ok(forecast) => Arc::new(forecast),
            Err(e) => {
                warn!("Weather client unavailable, rain overlay disabled: {}", e);
                Arc::new(NoRain)
            }
        }
    }
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    // Initialize tracing with pretty colors
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("sunrise_alarm=info,sunrised=info")),
        )
        .compact()
        .init();

    // Initialize color-eyre for pretty error reporting
    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let config = cli.strip.engine_config();

    // Without a working strip there is nothing to do
    let strip = match device::open(cli.strip.device_kind(), &config.device) {
        Ok(strip) => strip,
        Err(e) => {
            error!("Failed to initialize LED strip: {}", e);
            return Err(Error::Device(e).into());
        }
    };

    let engine = AnimationEngine::new(strip, config, RunStateGuard::new(), cli.strip.rain_source())?;

    let result = match cli.command.unwrap_or(Commands::Test) {
        Commands::Serve {
            listen,
            schedule,
            tick,
        } => serve(&engine, listen, schedule, Duration::from_secs(tick)).await,
        Commands::Test => run_once(&engine, AnimationRequest::DiagnosticSuite).await,
        Commands::Alarm => run_once(&engine, AnimationRequest::SunriseAlarm).await,
        Commands::Clear => run_once(&engine, AnimationRequest::Clear).await,
        Commands::Fill { red, green, blue } => {
            run_once(&engine, AnimationRequest::ColorFill(Color::new(red, green, blue))).await
        }
        Commands::Scan { red, green, blue } => {
            run_once(&engine, AnimationRequest::PixelScan(Color::new(red, green, blue))).await
        }
        Commands::Ramp { levels } => run_once(&engine, AnimationRequest::BrightnessRamp(levels)).await,
    };

    engine.shutdown().await;
    result
}

/// Runs one animation, cancelling it on Ctrl-C
#[instrument(skip(engine))]
async fn run_once(engine: &AnimationEngine, request: AnimationRequest) -> Result<()> {
    let Some(mut handle) = engine.trigger(request).into_handle() else {
        return Err(Error::AlreadyRunning.into());
    };

    let result = tokio::select! {
        result = &mut handle => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, cancelling animation");
            engine.cancel_running();
            handle.await
        }
    };

    match result? {
        Ok(RunOutcome::Completed) => info!("Done"),
        Ok(RunOutcome::Cancelled) => info!("Cancelled"),
        Err(e) => return Err(Error::Animation(e).into()),
    }
    Ok(())
}

/// Runs the schedule evaluator and HTTP API until Ctrl-C or the server stops
#[instrument(skip(engine))]
async fn serve(
    engine: &AnimationEngine,
    listen: SocketAddr,
    schedule_path: PathBuf,
    tick: Duration,
) -> Result<()> {
    let store = ScheduleStore::new(schedule_path);
    let schedule: SharedSchedule = Arc::new(RwLock::new(store.load()?));
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;

    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C, shutting down: {}", e),
        }
    };
    let state = AppState::new(engine.clone(), schedule, Some(store));
    server::run_daemon(state, listener, tick, ctrl_c).await?;
    Ok(())
}
