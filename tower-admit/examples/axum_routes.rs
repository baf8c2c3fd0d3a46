use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Json;
use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::extract::Request;
use axum::routing::get;
use clap::Parser;
use serde::Serialize;
use tower::BoxError;
use tower::ServiceBuilder;
use tower_admit::AdmissionConfig;
use tower_admit::AdmissionLayer;
use tower_admit::client_ip;
use tower_admit::handle_admit_error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Serve one unlimited route plus one route per configured limiter.
#[derive(Parser, Debug)]
struct Args {
    /// YAML admission config; the built-in /limit1../limit4 routes when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value = "127.0.0.1:3000")]
    listen: SocketAddr,
}

#[derive(Serialize)]
struct Message {
    msg: String,
}

fn reply(msg: String) -> Json<Message> {
    Json(Message { msg })
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // 1. Validate every limiter before serving anything
    let config = match &args.config {
        Some(path) => AdmissionConfig::from_file(path)?,
        None => AdmissionConfig::default(),
    };
    let limiters = config.build()?;

    // 2. Build the Router, one limiter per protected route
    let mut app = Router::new().route(
        "/unlimited",
        get(|| async { reply("unlimited route".to_string()) }),
    );

    for (route, limiter) in limiters {
        // Keyed registries are swept for the life of the process
        let _sweeper = limiter.start_eviction();

        let admission =
            AdmissionLayer::<Request>::new(limiter).with_key(|req: &Request| client_ip(req));
        let msg = format!("{route} admitted");
        let handler = get(move || {
            let msg = msg.clone();
            async move { reply(msg) }
        })
        .layer(
            ServiceBuilder::new()
                // The outermost layer: turns rejections into 429/408/503 responses
                .layer(HandleErrorLayer::new(handle_admit_error))
                .layer(admission)
                // Converts the route's Infallible to BoxError for the limiters
                .map_err(BoxError::from),
        );
        app = app.route(&route, handler);
    }

    // 3. Serve, recording peer addresses for client_ip
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(addr = %args.listen, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
