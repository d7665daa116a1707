use dakiya::{
    app::{router, AppState},
    config::Config,
};
use tower_http::{
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dakiya=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::debug!("starting with {:?}", config);

    let app_state = AppState::new(&config).await?;
    app_state.run_migration().await?;

    // client-side routes all resolve to the single page entry
    let app = router(app_state)
        .fallback_service(ServeDir::new("public").fallback(ServeFile::new("public/index.html")))
        .layer(TraceLayer::new_for_http());

    tracing::info!("listening on {}", config.bind_addr);

    axum::Server::bind(&config.bind_addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
