use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;

use marshal::cli::Cli;
use marshal::config::{ConfigError, ServerConfig};
use marshal::controller::Controller;
use marshal::database::{DatabaseClient, SqliteDatabase};
use marshal::event::Event;
use marshal::network::RegistrationClient;
use marshal::server::{Transport, UdpTransport};

/// Exit codes: 0 clean shutdown, 1 fatal registration (or database)
/// failure, 2 asset loading failure, 3 configuration error.
#[tokio::main]
async fn main() {
    env_logger::init(); // Use log::* to write to stdout/err
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let mut config = match ServerConfig::load(cli.config_dir.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            log::error!("{:#}", error);
            return 3;
        }
    };
    if let Err(error) = cli.apply(&mut config) {
        log::error!("{:#}", error);
        return 3;
    }
    if let Err(error) = config.validate() {
        log::error!("{}", error);
        return match error {
            ConfigError::Assets(_) => 2,
            ConfigError::Invalid(_) => 3,
        };
    }

    let db_path = cli
        .config_dir
        .clone()
        .unwrap_or_default()
        .join(&config.database_file);
    let db = match SqliteDatabase::open(&db_path, &config.server_uid) {
        Ok(db) => DatabaseClient::Sqlite(db),
        Err(error) => {
            log::error!("cannot open database {}: {}", db_path.display(), error);
            return 1;
        }
    };

    // Register with the backing service before accepting anyone;
    // a permanently failing endpoint on first run is fatal.
    if !config.register_url.is_empty() {
        let registration = match RegistrationClient::new(&config) {
            Ok(client) => client,
            Err(error) => {
                log::error!("{:#}", error);
                return 1;
            }
        };
        if let Err(error) = registration.register(&config).await {
            log::error!("registration permanently failed: {:#}", error);
            return 1;
        }
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();

    let bind_address = cli.bind_address.as_deref().unwrap_or("0.0.0.0:2759");
    let transport = match UdpTransport::bind(bind_address, events_tx.clone()).await {
        Ok(transport) => transport,
        Err(error) => {
            log::error!("{:#}", error);
            return 1;
        }
    };

    let controller = match Controller::init(
        config,
        transport.clone() as Arc<dyn Transport>,
        db,
        events_tx.clone(),
    )
    .await
    {
        Ok(controller) => controller,
        Err(error) => {
            log::error!("failed to initialise the lobby: {:#}", error);
            return 1;
        }
    };

    // The fixed-rate tick driving every deadline check.
    let ticker_tx = events_tx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(10));
        loop {
            interval.tick().await;
            if ticker_tx.send(Event::Tick).is_err() {
                break;
            }
        }
    });

    log::info!("lobby running");
    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => controller.on_event(event).await,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                break;
            }
        }
    }

    0
}
