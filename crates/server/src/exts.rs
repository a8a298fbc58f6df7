//! Request-scoped context injected by the auth hoops.

use salvo::prelude::Depot;

use crate::core::identifiers::{OwnedDeviceId, OwnedServerName, OwnedUserId};
use crate::{AppError, AppResult, MatrixError};

/// The local user a client request acts as, resolved from its access token.
#[derive(Clone, Debug)]
pub struct AuthedUser {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
}

impl AuthedUser {
    pub fn user_id(&self) -> &crate::core::identifiers::UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &crate::core::identifiers::DeviceId {
        &self.device_id
    }
}

/// The remote server a federation request was signed by.
#[derive(Clone, Debug)]
pub struct AuthedServer {
    pub origin: OwnedServerName,
}

pub trait DepotExt {
    fn authed_user(&self) -> AppResult<&AuthedUser>;
    fn origin(&self) -> AppResult<&OwnedServerName>;
}

impl DepotExt for Depot {
    fn authed_user(&self) -> AppResult<&AuthedUser> {
        self.obtain::<AuthedUser>()
            .map_err(|_| AppError::from(MatrixError::missing_token("Missing access token.")))
    }

    fn origin(&self) -> AppResult<&OwnedServerName> {
        self.obtain::<AuthedServer>()
            .map(|authed| &authed.origin)
            .map_err(|_| {
                AppError::from(MatrixError::unauthorized("Missing X-Matrix authorization."))
            })
    }
}
