use clap::Parser;
use quire_collabd::{run, Settings};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Quire real-time collaboration daemon", long_about = None)]
struct Cli {
    #[arg(
        long,
        default_value = "127.0.0.1:17817",
        help = "Listen address for the websocket and health endpoints"
    )]
    listen: SocketAddr,

    #[arg(
        long,
        default_value_t = 10_000,
        help = "Milliseconds a new connection has to authenticate"
    )]
    auth_timeout_ms: u64,

    #[arg(
        long,
        default_value_t = 30_000,
        help = "Grace period in milliseconds before a dropped connection is evicted"
    )]
    disconnect_timeout_ms: u64,

    #[arg(
        long,
        default_value_t = 900_000,
        help = "Milliseconds of silence after which a connection is closed"
    )]
    message_timeout_ms: u64,

    #[arg(
        long,
        default_value_t = 30_000,
        help = "Interval in milliseconds between websocket pings"
    )]
    health_check_interval_ms: u64,

    #[arg(
        long,
        default_value_t = 10_000,
        help = "Milliseconds a ping may stay unanswered"
    )]
    health_check_timeout_ms: u64,

    #[arg(
        long,
        default_value_t = 30_000,
        help = "Milliseconds before an unacknowledged tool operation is force-completed"
    )]
    tool_operation_timeout_ms: u64,

    #[arg(
        long,
        default_value_t = 60_000,
        help = "Interval in milliseconds between idle project sweeps"
    )]
    sweep_interval_ms: u64,

    #[arg(
        long,
        default_value_t = 3_600_000,
        help = "Age in milliseconds after which an idle project is evicted"
    )]
    max_session_age_ms: u64,

    #[arg(
        long,
        default_value_t = 900_000,
        help = "Milliseconds after which a project operation stops counting as pending"
    )]
    operation_ttl_ms: u64,

    #[arg(
        long,
        value_name = "PATH",
        help = "JSON file mapping session hashes to users and projects"
    )]
    sessions_file: Option<PathBuf>,

    #[arg(long, default_value_t = 1024, help = "Capacity of the in-process message bus")]
    bus_capacity: usize,

    #[arg(long, help = "OTLP endpoint for metrics (e.g., http://localhost:4318)")]
    otlp_endpoint: Option<String>,
}

impl From<Cli> for Settings {
    fn from(cli: Cli) -> Self {
        Settings {
            listen: cli.listen,
            auth_timeout: Duration::from_millis(cli.auth_timeout_ms),
            disconnect_timeout: Duration::from_millis(cli.disconnect_timeout_ms),
            message_timeout: Duration::from_millis(cli.message_timeout_ms),
            health_check_interval: Duration::from_millis(cli.health_check_interval_ms),
            health_check_timeout: Duration::from_millis(cli.health_check_timeout_ms),
            tool_operation_timeout: Duration::from_millis(cli.tool_operation_timeout_ms),
            sweep_interval: Duration::from_millis(cli.sweep_interval_ms),
            max_session_age: Duration::from_millis(cli.max_session_age_ms),
            operation_ttl: Duration::from_millis(cli.operation_ttl_ms),
            sessions_file: cli.sessions_file,
            bus_capacity: cli.bus_capacity,
            otlp_endpoint: cli.otlp_endpoint,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    run(Settings::from(cli)).await
}
