mod cameras;
mod config;
mod diagnostics;
mod engine;
mod error;
mod output;
mod state;
mod supervisor;
mod web;

#[cfg(test)]
mod test_support;

use cameras::StaticCameraRegistry;
use clap::Parser;
use config::AppConfig;
use engine::Engine;
use state::AppState;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// cam-hls - RTSP to HLS stream supervisor
/// 解析命令行参数，加载配置文件，启动HTTP服务及后台健康检查
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "cam-hls.yaml")]
    config: String,

    /// 覆盖配置文件中的监听地址
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，默认 info 级别，可通过 RUST_LOG 调整
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // 加载配置文件
    let mut config = AppConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    info!(
        "cam-hls initialized. HLS Root: {}, transcoder: {}",
        config.server.hls_root, config.server.ffmpeg_binary
    );
    for cam in &config.cameras {
        info!(
            "Camera [{}] {} (enabled: {})",
            cam.id,
            cam.label.as_deref().unwrap_or("-"),
            cam.enabled
        );
    }

    let cameras = Arc::new(StaticCameraRegistry::from_config(&config.cameras));
    let state = Arc::new(AppState::new(config.clone(), cameras));

    // 启动后台健康检查
    let monitor = tokio::spawn(supervisor::start_supervisor(
        state.clone(),
        config.server.supervisor_interval_ms,
    ));

    let app = web::router(state.clone());

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 先停掉健康检查，避免关停过程中再次拉起进程
    monitor.abort();
    Engine::shutdown_all(&state).await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
