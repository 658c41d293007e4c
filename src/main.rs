use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use axum::Router;
use specchio::{
    application::{
        error::AppError,
        relay::{RelayService, backend::RenderBackend, store::MemorySessionStore},
        renderer::RendererService,
        transform::steps::build_pipeline,
    },
    config,
    infra::{
        backend::{HttpRenderBackend, LocalRenderBackend},
        engine::ChromiumLauncher,
        error::InfraError,
        http::{RelayState, RendererState, build_relay_router, build_renderer_router},
        telemetry,
    },
};
use tokio::{net::TcpListener, sync::Notify, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::default()));

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Relay(_) => run_relay(settings).await,
        config::Command::Renderer(_) => run_renderer(settings).await,
    }
}

/// Relay and renderer in one process; the relay drives the renderer
/// in-process instead of over the loopback.
async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let renderer = build_renderer(&settings);
    let backend = Arc::new(LocalRenderBackend::new(renderer.clone()));
    let relay_state = build_relay_state(&settings, backend)?;
    let renderer_state = RendererState { renderer };

    let relay_listener = bind(settings.server.relay_addr).await?;
    let renderer_listener = bind(settings.server.renderer_addr).await?;

    info!(
        target = "specchio::serve",
        relay = %settings.server.relay_addr,
        renderer = %settings.server.renderer_addr,
        start_target = %settings.relay.target_url,
        "specchio serving"
    );

    let graceful = settings.server.graceful_shutdown;
    try_join!(
        serve(relay_listener, build_relay_router(relay_state), graceful),
        serve(
            renderer_listener,
            build_renderer_router(renderer_state),
            graceful
        ),
    )?;
    Ok(())
}

async fn run_relay(settings: config::Settings) -> Result<(), AppError> {
    let backend = Arc::new(HttpRenderBackend::new(
        settings.relay.renderer_url.clone(),
        settings.relay.backend_timeout,
    )?);
    let relay_state = build_relay_state(&settings, backend)?;

    let listener = bind(settings.server.relay_addr).await?;
    info!(
        target = "specchio::serve",
        relay = %settings.server.relay_addr,
        renderer_url = %settings.relay.renderer_url,
        "relay serving"
    );

    serve(
        listener,
        build_relay_router(relay_state),
        settings.server.graceful_shutdown,
    )
    .await
}

async fn run_renderer(settings: config::Settings) -> Result<(), AppError> {
    let renderer_state = RendererState {
        renderer: build_renderer(&settings),
    };

    let listener = bind(settings.server.renderer_addr).await?;
    info!(
        target = "specchio::serve",
        renderer = %settings.server.renderer_addr,
        "renderer serving"
    );

    serve(
        listener,
        build_renderer_router(renderer_state),
        settings.server.graceful_shutdown,
    )
    .await
}

fn build_renderer(settings: &config::Settings) -> Arc<RendererService> {
    let launcher = Box::new(ChromiumLauncher::new(settings.engine.clone()));
    Arc::new(RendererService::new(
        launcher,
        settings.renderer.nav_timeout,
        settings.renderer.settle_grace,
    ))
}

fn build_relay_state(
    settings: &config::Settings,
    backend: Arc<dyn RenderBackend>,
) -> Result<RelayState, AppError> {
    let transforms = build_pipeline(&settings.relay.transforms)
        .map_err(|err| AppError::from(InfraError::configuration(err.to_string())))?;

    let relay = Arc::new(RelayService::new(
        Arc::new(MemorySessionStore::new()),
        backend,
        settings.relay.target_url.clone(),
        transforms,
    ));

    Ok(RelayState {
        relay,
        cookie_name: Arc::from(settings.relay.cookie_name.as_str()),
    })
}

async fn bind(addr: std::net::SocketAddr) -> Result<TcpListener, AppError> {
    TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))
}

/// Serve until shutdown is signalled, then drain for at most `graceful`.
async fn serve(listener: TcpListener, router: Router, graceful: Duration) -> Result<(), AppError> {
    let signaled = Arc::new(Notify::new());
    let trigger = signaled.clone();

    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!(target = "specchio::serve", "shutdown signal received; draining");
            trigger.notify_one();
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))
        }
        _ = async { signaled.notified().await; tokio::time::sleep(graceful).await } => {
            warn!(
                target = "specchio::serve",
                "graceful drain window elapsed; shutting down"
            );
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
