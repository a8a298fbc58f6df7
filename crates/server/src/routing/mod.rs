//! The HTTP surface: client API, federation API, key endpoints and the
//! well-known delegation pointer.

mod client;
mod federation;
mod key;

use salvo::catcher::Catcher;
use salvo::prelude::*;
use salvo::writing::Scribe;

use crate::core::federation::directory::ServerWellKnown;
use crate::{JsonResult, MatrixError, config, hoops, json_ok};

pub fn service() -> Service {
    Service::new(root()).catcher(Catcher::default().hoop(render_unmatched))
}

pub fn root() -> Router {
    Router::new()
        .hoop(hoops::limit_size)
        .hoop(hoops::rate_limit)
        .push(
            Router::with_path("_matrix")
                .push(client::router())
                .push(federation::router())
                .push(key::router()),
        )
        .push(
            Router::with_path(".well-known/matrix/server").get(well_known_server),
        )
}

#[handler]
fn well_known_server() -> JsonResult<ServerWellKnown> {
    json_ok(ServerWellKnown {
        server: format!("{}:{}", config::server_name().host(), 8448),
    })
}

/// Unknown endpoints answer with the Matrix error shape instead of a bare
/// 404.
#[handler]
async fn render_unmatched(res: &mut Response, ctrl: &mut FlowCtrl) {
    if res.status_code == Some(StatusCode::NOT_FOUND) && res.body.is_none() {
        MatrixError::unrecognized("Unrecognized request.").render(res);
        ctrl.skip_rest();
    }
}
