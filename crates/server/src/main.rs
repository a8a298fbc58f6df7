#[macro_use]
extern crate tracing;

pub mod config;
pub mod data;
pub mod event;
pub mod federation;
pub mod hoops;
pub mod membership;
pub mod presence;
pub mod room;
pub mod routing;
pub mod sending;
pub mod server_key;
pub mod sync;
pub mod transaction_id;

mod error;
mod exts;
mod logging;

pub use error::AppError;
pub use exts::{AuthedServer, AuthedUser, DepotExt};
pub use hearth_core as core;

pub use crate::core::{EmptyObject, MatrixError};

use salvo::prelude::*;

pub type AppResult<T> = Result<T, crate::AppError>;
pub type JsonResult<T> = Result<Json<T>, crate::AppError>;
pub type EmptyResult = Result<Json<EmptyObject>, crate::AppError>;

pub fn json_ok<T>(data: T) -> JsonResult<T> {
    Ok(Json(data))
}

pub fn empty_ok() -> EmptyResult {
    Ok(Json(EmptyObject {}))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    logging::init();

    let conf = config::load()?;
    config::init(conf);
    server_key::init()?;

    info!(
        server_name = %config::server_name(),
        addr = %config::listen_addr(),
        "starting hearth"
    );

    let acceptor = TcpListener::new(config::listen_addr()).bind().await;
    let service = routing::service();

    let server = Server::new(acceptor);
    let handle = server.handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
        handle.stop_graceful(std::time::Duration::from_secs(10));
    });

    server.serve(service).await;
    Ok(())
}
