use anyhow::Context;
use beach_tap::{
    build_router,
    cli::{self, Cli, Commands, ServeArgs},
    config::Config,
    host::SessionHost,
    storage::Storage,
};
use clap::Parser;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Create { server, target }) => cli::run_create(server, target).await,
        Some(Commands::Watch { url, session, json }) => cli::run_watch(url, session, json).await,
        Some(Commands::Serve(args)) => serve(args).await,
        None => serve(ServeArgs::default()).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.apply(Config::from_env());
    info!("Starting beach-tap on {}", config.bind_addr());
    info!(
        log_capacity = config.log_capacity,
        forward_timeout_secs = config.forward_timeout_seconds,
        idle_suspend_secs = config.idle_suspend_seconds,
        "session settings"
    );

    let storage = Storage::from_config(&config)
        .await
        .context("failed to initialise session storage")?;
    info!(durable = storage.is_durable(), "session storage ready");

    let addr = config.bind_addr();
    let host = SessionHost::new(config, storage);
    let _reaper = host.spawn_idle_reaper();
    let app = build_router(host);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("beach-tap listening on {}", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
