mod routes;

use std::{error::Error, net::SocketAddr, time::Duration};

use axum_server::{tls_rustls::RustlsConfig, Handle};
use crm::{application::lifecycle::ApplicationContext, CrmConfig};
use tracing::{error, info, Level};

#[tokio::main]
async fn main() {
    match CrmConfig::load() {
        Ok(config) => {
            tracing_subscriber::fmt()
                .with_max_level(Level::from(&config.logger.level))
                .init();
            if let Err(error) = serve(&config).await {
                error!("アプリケーションエラー: {}", error);
            }
        }
        Err(error) => {
            tracing_subscriber::fmt::init();
            error!("アプリケーションエラー: {}", error)
        }
    }
}

async fn serve(config: &CrmConfig) -> Result<(), Box<dyn Error>> {
    let context = ApplicationContext::new(config)?;
    context.refresh().await;

    let app = routes::router(context.service());
    let addr = config.web.address.parse::<SocketAddr>()?;
    let handle = Handle::new();
    tokio::spawn(shutdown_on_ctrl_c(handle.clone()));

    match &config.web.tls {
        Some(tls) => {
            let rustls = RustlsConfig::from_pem_file(&tls.cert, &tls.key).await?;
            info!("HTTPSで待ち受けます: {}", addr);
            axum_server::bind_rustls(addr, rustls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            info!("HTTPで待ち受けます: {}", addr);
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
    }

    context.close().await;
    Ok(())
}

async fn shutdown_on_ctrl_c(handle: Handle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("シャットダウンします");
        handle.graceful_shutdown(Some(Duration::from_secs(10)));
    }
}
