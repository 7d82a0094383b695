//! ark-client entry point.
//!
//! Loads the configuration, installs logging, wires the infrastructure
//! adapters into the application services, and runs one sub-command.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ AppConfig::load()          -- TOML config, validated
//!  └─ App::build()
//!       ├─ AdbBridge             -- every device command
//!       ├─ DeviceManager         -- scan / connect / last device
//!       ├─ SecureChannel         -- encrypted request/response
//!       ├─ AuthService           -- register / login / reauth
//!       └─ TouchInjectionChannel -- touch daemon sessions
//!  └─ sub-command
//!       └─ run: AutomationEngine event loop until Stopped or Ctrl-C
//! ```
//!
//! # Usage
//!
//! ```text
//! ark-client [--config FILE] [--cache-dir DIR] [-s SERIAL] <COMMAND>
//!
//! Commands:
//!   devices                 list attached devices
//!   register <USER>         create an account and store its credential
//!   login [--file FILE]     log in from a credential file or stored credentials
//!   tasks                   list the tasks the service offers
//!   tap <X> <Y>             tap a normalized point
//!   swipe <X1> <Y1> <X2> <Y2>
//!   run [TASK_ID…]          run tasks (or the saved queue) until complete
//!   version                 compare with the latest client version
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use ark_core::domain::action::NormPoint;
use ark_core::{Device, TaskInstance, TaskQueue, TouchAction};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ark_client::application::authenticate::AuthService;
use ark_client::application::automate::{
    AutomationEngine, EngineEvent, EnginePorts, JoinOutcome, RunOutcome, TouchActuator,
};
use ark_client::application::catalog::{check_version, fetch_default_tasks};
use ark_client::infrastructure::device_bridge::{AdbBridge, DeviceManager};
use ark_client::infrastructure::network::SecureChannel;
use ark_client::infrastructure::screen::BridgeScreenSampler;
use ark_client::infrastructure::storage::config::config_dir;
use ark_client::infrastructure::storage::{AppConfig, FileCredentialVault, StateStore};
use ark_client::infrastructure::touch::{ArtifactCache, TouchInjectionChannel};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Automation client: drives an Android device from a remote inference service.
#[derive(Debug, Parser)]
#[command(name = "ark-client", version)]
struct Cli {
    /// Path to the TOML config file (defaults to the platform config dir).
    #[arg(long, env = "ARK_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for credentials, state files, and downloaded device binaries.
    #[arg(long, env = "ARK_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Device serial; defaults to the last connected device.
    #[arg(short = 's', long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List attached devices.
    Devices,
    /// Register a new account and store its credential.
    Register { user_id: String },
    /// Log in from a credential file, or with the stored credentials.
    Login {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List the tasks the service offers.
    Tasks,
    /// Tap a normalized point (0..1) on the device.
    Tap { x: f64, y: f64 },
    /// Swipe between two normalized points.
    Swipe {
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        #[arg(long, default_value_t = 300)]
        duration_ms: u64,
    },
    /// Run the given task ids, or the saved queue when none are given.
    Run {
        task_ids: Vec<String>,
        /// Passes over the whole queue.
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Compare this client's version with the latest release.
    Version,
}

// ── Wiring ────────────────────────────────────────────────────────────────────

struct App {
    config: AppConfig,
    state: StateStore,
    devices: DeviceManager,
    bridge: Arc<AdbBridge>,
    channel: Arc<SecureChannel>,
    auth: Arc<AuthService>,
    touch: Arc<TouchInjectionChannel>,
}

impl App {
    fn build(config: AppConfig, cache_dir: &Path) -> anyhow::Result<Self> {
        let bridge = Arc::new(AdbBridge::new(
            config.device.adb_path.clone(),
            config.command_timeout(),
        ));
        let state = StateStore::new(cache_dir);
        let devices = DeviceManager::new(bridge.clone()).with_state(state.clone());

        let server = &config.server;
        let channel = Arc::new(SecureChannel::new(
            &server.host,
            server.port,
            &server.passphrase,
            config.server_timeout(),
        ));
        let auth = Arc::new(
            AuthService::new(channel.clone())
                .with_vault(Arc::new(FileCredentialVault::new(cache_dir)))
                .with_server(server.host.clone(), server.port),
        );

        let artifacts = ArtifactCache::new(cache_dir.join("bin"))
            .context("failed to initialise the download client")?;
        let touch = Arc::new(TouchInjectionChannel::new(
            bridge.clone(),
            Arc::new(artifacts),
            config.touch_config(),
        ));

        Ok(Self {
            config,
            state,
            devices,
            bridge,
            channel,
            auth,
            touch,
        })
    }

    /// Connects the requested device, the last one used, or the first online one.
    async fn select_device(&self, serial: Option<&str>) -> anyhow::Result<Device> {
        if let Some(serial) = serial {
            return self
                .devices
                .connect(serial)
                .await
                .with_context(|| format!("cannot connect to {serial}"));
        }
        if let Some(device) = self.devices.connect_last().await? {
            return Ok(device);
        }
        let first = self.devices.scan().await?.into_iter().find(Device::is_online);
        match first {
            Some(device) => Ok(self.devices.connect(&device.serial).await?),
            None => bail!("no online device found; pass --device <serial>"),
        }
    }

    async fn with_touch<F, Fut>(&self, serial: Option<&str>, act: F) -> anyhow::Result<()>
    where
        F: FnOnce(Device) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let device = self.select_device(serial).await?;
        self.touch
            .connect(&device)
            .await
            .context("touch daemon setup failed")?;
        let result = act(device.clone()).await;
        self.touch.disconnect(&device.serial).await;
        result
    }

    /// Builds the run queue from task ids, or loads the saved queue.
    async fn queue_for(&self, task_ids: &[String], repeat: u32) -> anyhow::Result<TaskQueue> {
        let mut queue = if task_ids.is_empty() {
            match self.state.load_queue()? {
                Some(queue) if !queue.is_empty() => queue,
                _ => bail!("no saved queue; pass task ids to run"),
            }
        } else {
            let catalog = fetch_default_tasks(self.channel.as_ref()).await?;
            let mut queue = TaskQueue::new();
            for id in task_ids {
                let definition = catalog
                    .iter()
                    .find(|d| &d.id == id)
                    .with_context(|| format!("unknown task '{id}'"))?;
                let mut task = TaskInstance::new(definition.clone());
                self.state.apply_preferences(&mut task)?;
                queue.push(task);
            }
            queue
        };
        queue.set_repeat_count(repeat)?;
        queue.reset_cursor();
        Ok(queue)
    }

    async fn run(&self, serial: Option<&str>, task_ids: &[String], repeat: u32) -> anyhow::Result<()> {
        let session = self.auth.auto_login().await.context("login failed")?;
        info!(user = %session.user_id, "logged in");

        let queue = self.queue_for(task_ids, repeat).await?;
        let device = self.select_device(serial).await?;
        self.touch
            .connect(&device)
            .await
            .context("touch daemon setup failed")?;

        let ports = EnginePorts {
            sampler: Arc::new(BridgeScreenSampler::new(
                self.bridge.clone(),
                self.config.capture.max_dimension,
                self.config.capture.jpeg_quality,
            )),
            exchanger: self.channel.clone(),
            actuator: self.touch.clone(),
            auth: self.auth.clone(),
        };
        let (engine, mut events) = AutomationEngine::new(ports, self.config.engine_config());
        engine
            .edit_queue(|q| *q = queue)
            .context("queue is busy")?;
        let run_id = engine.start(Some(device.clone()))?;
        info!(%run_id, device = %device.serial, "run started");

        let outcome = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(EngineEvent::Progress(p)) => info!(
                        pass = p.pass,
                        passes = p.passes,
                        index = p.index + 1,
                        total = p.total,
                        task = %p.task_name,
                        "working"
                    ),
                    Some(EngineEvent::Stopped { outcome, .. }) => break outcome,
                    None => break RunOutcome::Failed("engine event channel closed".into()),
                },
                signal = tokio::signal::ctrl_c() => {
                    if signal.is_ok() {
                        info!("shutdown signal received");
                    }
                    match engine.shutdown(self.config.join_timeout()).await {
                        JoinOutcome::TimedOut => warn!("worker did not stop in time and was aborted"),
                        JoinOutcome::Panicked => error!("worker panicked"),
                        JoinOutcome::Joined | JoinOutcome::Idle => {}
                    }
                }
            }
        };
        engine.wait().await;

        if let Err(e) = self.state.save_queue(&engine.queue_snapshot()) {
            warn!(error = %e, "failed to save the task queue");
        }
        self.touch.disconnect(&device.serial).await;

        match outcome {
            RunOutcome::Completed => {
                println!("All tasks completed.");
                Ok(())
            }
            RunOutcome::Cancelled => {
                println!("Run stopped.");
                Ok(())
            }
            RunOutcome::Failed(reason) => bail!("run aborted: {reason}"),
        }
    }
}

fn resolve_cache_dir(cli: Option<PathBuf>, config: &AppConfig) -> PathBuf {
    cli.or_else(|| config.touch.cache_dir.clone())
        .or_else(|| config_dir().ok().map(|d| d.join("cache")))
        .unwrap_or_else(|| PathBuf::from("cache"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    // Initialise structured logging.
    let level = config.logging.level.clone();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let cache_dir = resolve_cache_dir(cli.cache_dir, &config);
    info!(cache_dir = %cache_dir.display(), "ark-client starting");
    let app = App::build(config, &cache_dir)?;
    let serial = cli.device.as_deref();

    match cli.command {
        Command::Devices => {
            for device in app.devices.scan().await? {
                println!(
                    "{:<24} {:<14} {}",
                    device.serial,
                    format!("{:?}", device.state).to_lowercase(),
                    device.model.as_deref().unwrap_or("-")
                );
            }
        }

        Command::Register { user_id } => {
            app.auth.register(&user_id).await?;
            println!("Registered {user_id}; credential stored in {}", cache_dir.display());
        }

        Command::Login { file } => {
            let session = match file {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("cannot read {}", path.display()))?;
                    app.auth.login_with_text(&text).await?
                }
                None => app.auth.auto_login().await?,
            };
            println!("Logged in as {}", session.user_id);
            match app.auth.user_info().await {
                Ok(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                Err(e) => warn!(error = %e, "user info unavailable"),
            }
        }

        Command::Tasks => {
            for task in fetch_default_tasks(app.channel.as_ref()).await? {
                println!("{:<24} {}", task.id, task.name);
            }
        }

        Command::Tap { x, y } => {
            let touch = app.touch.clone();
            app.with_touch(serial, |device| async move {
                let action = TouchAction::Tap {
                    at: NormPoint::new(x, y),
                    duration_ms: None,
                };
                touch.perform(&device, &[action]).await?;
                Ok(())
            })
            .await?;
        }

        Command::Swipe {
            x1,
            y1,
            x2,
            y2,
            duration_ms,
        } => {
            let touch = app.touch.clone();
            app.with_touch(serial, |device| async move {
                let action = TouchAction::Swipe {
                    from: NormPoint::new(x1, y1),
                    to: NormPoint::new(x2, y2),
                    duration_ms,
                    steps: None,
                };
                touch.perform(&device, &[action]).await?;
                Ok(())
            })
            .await?;
        }

        Command::Run { task_ids, repeat } => {
            app.run(serial, &task_ids, repeat).await?;
        }

        Command::Version => {
            let current = env!("CARGO_PKG_VERSION");
            let status = check_version(app.channel.as_ref(), current).await?;
            if status.update_available {
                println!("Update available: {} (running {})", status.latest, status.current);
            } else {
                println!("Up to date ({})", status.current);
            }
        }
    }

    Ok(())
}
