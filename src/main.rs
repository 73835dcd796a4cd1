//! Cloud adaptor - task consumers and admin commands

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cloud_adaptor::client::KubeconfigConnector;
use cloud_adaptor::config::{Config, LogFormat, TransportKind};
use cloud_adaptor::exec::{CommandRunner, SystemCommandRunner};
use cloud_adaptor::provider::ProviderRegistry;
use cloud_adaptor::service::{ClusterService, InitPlatformReq};
use cloud_adaptor::store::{TaskRecord, TaskStatus, TaskStore};
use cloud_adaptor::task::{TaskContext, TaskHandler, TaskKind};
use cloud_adaptor::transport::{
    ChannelTransport, Producer, RedisTransport, Subscriber, TaskProducer,
};

const FOLLOW_INTERVAL: Duration = Duration::from_secs(5);

/// Cloud adaptor - provisions Kubernetes clusters and installs the Wutong platform
#[derive(Parser, Debug)]
#[command(name = "cloud-adaptor", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Consume task messages until interrupted (default mode)
    Serve,

    /// Queue a platform installation and follow it
    InitPlatform {
        /// Target cluster
        #[arg(long)]
        cluster_id: String,
        /// Provider of the cluster
        #[arg(long, default_value = "custom")]
        provider: String,
        /// Enterprise the installation belongs to
        #[arg(long, default_value = "")]
        enterprise_id: String,
        /// Start over even though an earlier task exists
        #[arg(long)]
        retry: bool,
    },

    /// Print the event history of a task
    TaskEvents {
        /// Task id
        task_id: String,
    },

    /// Print the installation tasks that are not complete
    RunningTasks,

    /// Remove the platform from a cluster
    Uninstall {
        /// Target cluster
        #[arg(long)]
        cluster_id: String,
        /// Provider of the cluster
        #[arg(long, default_value = "custom")]
        provider: String,
    },
}

/// Everything a subcommand needs
struct Runtime {
    ctx: TaskContext,
    producer: Arc<dyn Producer>,
    subscriber: Arc<dyn Subscriber>,
    cancel: CancellationToken,
}

impl Runtime {
    async fn build(config: &Config, cancel: CancellationToken) -> anyhow::Result<Self> {
        if let Some(dir) = config.db_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::create_dir_all(&config.work_dir).await?;

        let store = TaskStore::open(&config.db_path.to_string_lossy())
            .map_err(|e| anyhow::anyhow!("Failed to open task store {:?}: {}", config.db_path, e))?;
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        let registry = ProviderRegistry::new(
            store.clone(),
            Arc::new(KubeconfigConnector),
            runner.clone(),
            config.rke_settings(),
        );
        let ctx = TaskContext {
            registry: Arc::new(registry),
            store,
            runner,
            settings: config.install_settings(),
            work_dir: config.work_dir.clone(),
        };

        let (producer, subscriber): (Arc<dyn Producer>, Arc<dyn Subscriber>) = match config.transport {
            TransportKind::Channel => {
                let transport = Arc::new(ChannelTransport::default());
                (transport.clone() as Arc<dyn Producer>, transport as Arc<dyn Subscriber>)
            }
            TransportKind::Redis => {
                let transport = RedisTransport::connect(&config.redis_url)
                    .map_err(|e| anyhow::anyhow!("Failed to create broker client: {}", e))?;
                transport
                    .wait_ready(&cancel)
                    .await
                    .map_err(|e| anyhow::anyhow!("Message broker unavailable: {}", e))?;
                (
                    Arc::new(transport.clone()) as Arc<dyn Producer>,
                    Arc::new(transport) as Arc<dyn Subscriber>,
                )
            }
        };

        Ok(Self {
            ctx,
            producer,
            subscriber,
            cancel,
        })
    }

    fn service(&self, config: &Config) -> ClusterService {
        ClusterService::new(
            self.ctx.clone(),
            TaskProducer::new(self.producer.clone()),
            self.cancel.clone(),
        )
        .with_uninstall_disabled(config.disable_uninstall_region)
    }

    /// Start one consumer per task kind
    fn start_consumers(&self) -> anyhow::Result<Vec<JoinHandle<()>>> {
        TaskKind::ALL
            .iter()
            .map(|kind| {
                let handler = TaskHandler::new(*kind, self.ctx.clone(), self.cancel.clone());
                self.subscriber
                    .subscribe(kind.topic(), Arc::new(handler), self.cancel.clone())
                    .map_err(|e| anyhow::anyhow!("Failed to subscribe {}: {}", kind.topic(), e))
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match cli.config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }

    let cancel = CancellationToken::new();
    let runtime = Runtime::build(&cli.config, cancel.clone()).await?;

    match cli.command {
        Some(Commands::Serve) | None => run_serve(&runtime).await,
        Some(Commands::InitPlatform {
            cluster_id,
            provider,
            enterprise_id,
            retry,
        }) => {
            let req = InitPlatformReq {
                cluster_id,
                provider,
                enterprise_id,
                retry,
            };
            run_init_platform(&runtime, &cli.config, req).await
        }
        Some(Commands::TaskEvents { task_id }) => {
            let events = runtime.service(&cli.config).list_task_events(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
        Some(Commands::RunningTasks) => {
            let tasks = runtime.service(&cli.config).running_init_tasks()?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
            Ok(())
        }
        Some(Commands::Uninstall {
            cluster_id,
            provider,
        }) => {
            let service = runtime.service(&cli.config);
            match service.uninstall_platform(&cluster_id, &provider).await? {
                Some(handle) => handle
                    .await
                    .map_err(|e| anyhow::anyhow!("Uninstall task failed: {}", e))?,
                None => println!("uninstall is disabled"),
            }
            Ok(())
        }
    }
}

/// Run the task consumers until interrupted
async fn run_serve(runtime: &Runtime) -> anyhow::Result<()> {
    tracing::info!("Cloud adaptor starting...");
    let consumers = runtime.start_consumers()?;
    tracing::info!(count = consumers.len(), "Task consumers started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down, cancelling running tasks");
    runtime.cancel.cancel();

    for consumer in consumers {
        if let Err(e) = consumer.await {
            tracing::warn!(error = %e, "Consumer ended abnormally");
        }
    }
    Ok(())
}

/// Queue an installation; with the in-process transport, also run it here
async fn run_init_platform(
    runtime: &Runtime,
    config: &Config,
    req: InitPlatformReq,
) -> anyhow::Result<()> {
    let service = runtime.service(config);
    let local = config.transport == TransportKind::Channel;
    let consumers = if local {
        runtime.start_consumers()?
    } else {
        Vec::new()
    };

    let task = service.init_platform(req).await?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    if !local {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(task_id = %task.task_id, "Interrupted, cancelling task");
                break;
            }
            _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
        }
        match service.get_task(&task.task_id)? {
            Some(TaskRecord::InitPlatform(current)) if current.status == TaskStatus::Complete => {
                tracing::info!(task_id = %task.task_id, "Task complete");
                break;
            }
            Some(TaskRecord::InitPlatform(current)) if current.status == TaskStatus::Inited => {
                tracing::info!(task_id = %task.task_id, "Platform installed");
                break;
            }
            _ => {}
        }
    }

    runtime.cancel.cancel();
    for consumer in consumers {
        if let Err(e) = consumer.await {
            tracing::warn!(error = %e, "Consumer ended abnormally");
        }
    }
    let events = service.list_task_events(&task.task_id).await?;
    println!("{}", serde_json::to_string_pretty(&events)?);
    Ok(())
}
