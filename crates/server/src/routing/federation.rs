//! The server-server API surface.

use salvo::prelude::*;
use serde_json::Value as JsonValue;

use crate::core::events::edu::DeviceIdOrAllDevices;
use crate::core::events::room::MembershipState;
use crate::core::federation::event::{
    BackfillResBody, EventAuthResBody, EventResBody, MissingEventsReqBody, MissingEventsResBody,
    RoomStateIdsResBody, RoomStateResBody,
};
use crate::core::federation::membership::{
    InviteUserReqBody, InviteUserResBody, MakeMembershipResBody, SendJoinResBody,
    SendKnockResBody,
};
use crate::core::federation::transaction::{
    EDU_LIMIT, Edu, PDU_LIMIT, SendMessageReqBody, SendMessageResBody,
};
use crate::core::identifiers::{OwnedEventId, OwnedRoomId, OwnedUserId, ServerName};
use crate::core::{EmptyObject, RoomVersionId, UnixMillis};
use crate::{
    AppResult, DepotExt, JsonResult, MatrixError, config, data, hoops, json_ok, membership, room,
};

pub fn router() -> Router {
    Router::with_path("federation")
        .hoop(hoops::auth_by_signatures)
        .push(
            Router::with_path("v1")
                .push(Router::with_path("send/{txn_id}").put(send_transaction))
                .push(Router::with_path("make_join/{room_id}/{user_id}").get(make_join))
                .push(Router::with_path("make_leave/{room_id}/{user_id}").get(make_leave))
                .push(Router::with_path("make_knock/{room_id}/{user_id}").get(make_knock))
                .push(Router::with_path("send_knock/{room_id}/{event_id}").put(send_knock))
                .push(Router::with_path("get_missing_events/{room_id}").post(get_missing_events))
                .push(Router::with_path("state/{room_id}").get(room_state))
                .push(Router::with_path("state_ids/{room_id}").get(room_state_ids))
                .push(Router::with_path("backfill/{room_id}").get(backfill))
                .push(Router::with_path("event_auth/{room_id}/{event_id}").get(event_auth))
                .push(Router::with_path("event/{event_id}").get(get_event)),
        )
        .push(
            Router::with_path("v2")
                .push(Router::with_path("send_join/{room_id}/{event_id}").put(send_join))
                .push(Router::with_path("send_leave/{room_id}/{event_id}").put(send_leave))
                .push(Router::with_path("invite/{room_id}/{event_id}").put(invite_user)),
        )
}

fn room_id_param(req: &mut Request) -> AppResult<OwnedRoomId> {
    req.param::<String>("room_id")
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| MatrixError::invalid_param("invalid room id").into())
}

fn event_id_param(req: &mut Request) -> AppResult<OwnedEventId> {
    req.param::<String>("event_id")
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| MatrixError::invalid_param("invalid event id").into())
}

fn user_id_param(req: &mut Request) -> AppResult<OwnedUserId> {
    req.param::<String>("user_id")
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| MatrixError::invalid_param("invalid user id").into())
}

fn ver_params(req: &mut Request) -> Vec<RoomVersionId> {
    let versions: Vec<RoomVersionId> = req
        .queries()
        .get_vec("ver")
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.as_str().parse().ok())
                .collect()
        })
        .unwrap_or_default();
    if versions.is_empty() {
        // Per the original federation API, no `ver` means version 1 only;
        // we accept anything we support instead of failing every legacy
        // caller outright.
        config::supported_room_versions()
    } else {
        versions
    }
}

/// Requires the origin to be resident in the room before serving its
/// events.
fn check_room_access(origin: &ServerName, room_id: &crate::core::identifiers::RoomId) -> AppResult<()> {
    if !data::room::exists(room_id) {
        return Err(MatrixError::not_found("unknown room").into());
    }
    room::acl_check(origin, room_id)?;
    if !data::room::is_server_joined(origin, room_id) {
        return Err(MatrixError::forbidden("server is not in the room").into());
    }
    Ok(())
}

/// `PUT /_matrix/federation/v1/send/{txnId}`
///
/// PDU failures are isolated per event; EDUs are processed best-effort.
/// Replaying a transaction yields the same per-PDU results and no new
/// effects.
#[handler]
async fn send_transaction(
    req: &mut Request,
    depot: &mut Depot,
) -> JsonResult<SendMessageResBody> {
    let origin = depot.origin()?.clone();
    let body: SendMessageReqBody = req.parse_json().await?;

    if body.origin != origin {
        return Err(MatrixError::forbidden(
            "not allowed to send transactions on behalf of other servers",
        )
        .into());
    }
    if body.pdus.len() > PDU_LIMIT {
        return Err(MatrixError::forbidden(format!(
            "not allowed to send more than {PDU_LIMIT} PDUs in one transaction"
        ))
        .into());
    }
    if body.edus.len() > EDU_LIMIT {
        return Err(MatrixError::forbidden(format!(
            "not allowed to send more than {EDU_LIMIT} EDUs in one transaction"
        ))
        .into());
    }

    let resolved_map = crate::event::handler::process_pdus(&body.pdus, &origin).await?;
    process_edus(body.edus, &origin).await;

    json_ok(SendMessageResBody::new(resolved_map))
}

async fn process_edus(edus: Vec<Edu>, origin: &ServerName) {
    for edu in edus {
        match edu {
            Edu::Typing(typing) => {
                if typing.user_id.server_name() != origin {
                    warn!(%origin, user = %typing.user_id, "typing edu for a foreign user");
                    continue;
                }
                if room::acl_check(origin, &typing.room_id).is_err()
                    || !data::room::is_joined(&typing.user_id, &typing.room_id)
                {
                    continue;
                }
                if typing.typing {
                    let expires =
                        UnixMillis::now().saturating_add(room::typing::TYPING_TIMEOUT_MS);
                    let _ = room::typing::add_typing(&typing.user_id, &typing.room_id, expires);
                } else {
                    let _ = room::typing::remove_typing(&typing.user_id, &typing.room_id);
                }
            }
            Edu::Receipt(receipt) => {
                for (room_id, updates) in receipt.0 {
                    if room::acl_check(origin, &room_id).is_err() {
                        continue;
                    }
                    for (user_id, receipt_data) in updates.read {
                        if user_id.server_name() != origin
                            || !data::room::is_joined(&user_id, &room_id)
                        {
                            continue;
                        }
                        for event_id in &receipt_data.event_ids {
                            let _ = room::receipt::update_read(
                                &user_id, &room_id, event_id, receipt_data.data.ts,
                            );
                        }
                    }
                }
            }
            Edu::Presence(presence) => {
                for update in presence.push {
                    if update.user_id.server_name() != origin {
                        warn!(%origin, user = %update.user_id, "presence edu for a foreign user");
                        continue;
                    }
                    crate::presence::apply_update(update);
                }
            }
            Edu::DeviceListUpdate(update) => {
                if update.user_id.server_name() != origin {
                    continue;
                }
                data::user::mark_device_list_change(&update.user_id);
                crate::sync::notify();
            }
            Edu::DirectToDevice(content) => {
                if content.sender.server_name() != origin {
                    continue;
                }
                // Exactly-once per (sender, message id).
                if crate::transaction_id::txn_id_exists(&content.message_id, &content.sender, None)
                {
                    continue;
                }
                for (target_user, devices) in &content.messages {
                    if target_user.server_name() != config::server_name() {
                        continue;
                    }
                    for (target, event) in devices {
                        match target {
                            DeviceIdOrAllDevices::DeviceId(device_id) => {
                                data::user::add_to_device_event(
                                    &content.sender,
                                    target_user,
                                    device_id,
                                    &content.ev_type,
                                    event.clone(),
                                );
                            }
                            DeviceIdOrAllDevices::AllDevices => {
                                for device_id in data::user::all_device_ids(target_user) {
                                    data::user::add_to_device_event(
                                        &content.sender,
                                        target_user,
                                        &device_id,
                                        &content.ev_type,
                                        event.clone(),
                                    );
                                }
                            }
                        }
                    }
                }
                crate::transaction_id::add_txn_id(&content.message_id, &content.sender, None, None);
                crate::sync::notify();
            }
            Edu::SigningKeyUpdate(update) => {
                if update.user_id.server_name() != origin {
                    continue;
                }
                data::user::mark_device_list_change(&update.user_id);
                crate::sync::notify();
            }
            Edu::_Custom(_) => {
                debug!("ignoring custom edu");
            }
        }
    }
}

/// `GET /_matrix/federation/v1/make_join/{roomId}/{userId}`
#[handler]
async fn make_join(req: &mut Request, depot: &mut Depot) -> JsonResult<MakeMembershipResBody> {
    let origin = depot.origin()?.clone();
    let room_id = room_id_param(req)?;
    let user_id = user_id_param(req)?;
    if user_id.server_name() != &*origin {
        return Err(MatrixError::forbidden("user does not belong to the requesting server").into());
    }
    room::acl_check(&origin, &room_id)?;

    let (room_version, event) = membership::make_membership_event(
        &room_id,
        &user_id,
        MembershipState::Join,
        &ver_params(req),
    )
    .await?;
    json_ok(MakeMembershipResBody {
        room_version: Some(room_version),
        event,
    })
}

/// `PUT /_matrix/federation/v2/send_join/{roomId}/{eventId}`
#[handler]
async fn send_join(req: &mut Request, depot: &mut Depot) -> JsonResult<SendJoinResBody> {
    let origin = depot.origin()?.clone();
    let room_id = room_id_param(req)?;
    let event_id = event_id_param(req)?;
    room::acl_check(&origin, &room_id)?;

    let value: JsonValue = req.parse_json().await?;
    json_ok(membership::join::ingest_send_join(&origin, &room_id, &event_id, &value).await?)
}

/// `GET /_matrix/federation/v1/make_leave/{roomId}/{userId}`
#[handler]
async fn make_leave(req: &mut Request, depot: &mut Depot) -> JsonResult<MakeMembershipResBody> {
    let origin = depot.origin()?.clone();
    let room_id = room_id_param(req)?;
    let user_id = user_id_param(req)?;
    if user_id.server_name() != &*origin {
        return Err(MatrixError::forbidden("user does not belong to the requesting server").into());
    }

    let (room_version, event) = membership::make_membership_event(
        &room_id,
        &user_id,
        MembershipState::Leave,
        &config::supported_room_versions(),
    )
    .await?;
    json_ok(MakeMembershipResBody {
        room_version: Some(room_version),
        event,
    })
}

/// `PUT /_matrix/federation/v2/send_leave/{roomId}/{eventId}`
#[handler]
async fn send_leave(req: &mut Request, depot: &mut Depot) -> JsonResult<EmptyObject> {
    let origin = depot.origin()?.clone();
    let room_id = room_id_param(req)?;
    let event_id = event_id_param(req)?;

    let value: JsonValue = req.parse_json().await?;
    membership::ingest_membership_event(
        &origin,
        &room_id,
        &event_id,
        &value,
        MembershipState::Leave,
    )
    .await?;
    json_ok(EmptyObject {})
}

/// `GET /_matrix/federation/v1/make_knock/{roomId}/{userId}`
#[handler]
async fn make_knock(req: &mut Request, depot: &mut Depot) -> JsonResult<MakeMembershipResBody> {
    let origin = depot.origin()?.clone();
    let room_id = room_id_param(req)?;
    let user_id = user_id_param(req)?;
    if user_id.server_name() != &*origin {
        return Err(MatrixError::forbidden("user does not belong to the requesting server").into());
    }
    room::acl_check(&origin, &room_id)?;

    let (room_version, event) = membership::make_membership_event(
        &room_id,
        &user_id,
        MembershipState::Knock,
        &ver_params(req),
    )
    .await?;
    json_ok(MakeMembershipResBody {
        room_version: Some(room_version),
        event,
    })
}

/// `PUT /_matrix/federation/v1/send_knock/{roomId}/{eventId}`
#[handler]
async fn send_knock(req: &mut Request, depot: &mut Depot) -> JsonResult<SendKnockResBody> {
    let origin = depot.origin()?.clone();
    let room_id = room_id_param(req)?;
    let event_id = event_id_param(req)?;

    let value: JsonValue = req.parse_json().await?;
    let pdu = membership::ingest_membership_event(
        &origin,
        &room_id,
        &event_id,
        &value,
        MembershipState::Knock,
    )
    .await?;

    json_ok(SendKnockResBody {
        knock_room_state: room::timeline::stripped_state(&room_id, &pdu),
    })
}

/// `PUT /_matrix/federation/v2/invite/{roomId}/{eventId}`
#[handler]
async fn invite_user(req: &mut Request, depot: &mut Depot) -> JsonResult<InviteUserResBody> {
    let origin = depot.origin()?.clone();
    let room_id = room_id_param(req)?;
    let event_id = event_id_param(req)?;
    let body: InviteUserReqBody = req.parse_json().await?;

    let event = membership::ingest_invite(
        &origin,
        &room_id,
        &event_id,
        &body.room_version,
        &body.event,
        body.invite_room_state,
    )
    .await?;
    json_ok(InviteUserResBody { event })
}

/// `POST /_matrix/federation/v1/get_missing_events/{roomId}`
#[handler]
async fn get_missing_events(
    req: &mut Request,
    depot: &mut Depot,
) -> JsonResult<MissingEventsResBody> {
    let origin = depot.origin()?.clone();
    let room_id = room_id_param(req)?;
    check_room_access(&origin, &room_id)?;

    let body: MissingEventsReqBody = req.parse_json().await?;
    let events = data::event::missing_between(
        &room_id,
        &body.earliest_events,
        &body.latest_events,
        body.limit.min(20),
        body.min_depth,
    )
    .into_iter()
    .filter_map(|pdu| room::timeline::outgoing_federation_json(&pdu.event_id).ok())
    .collect();

    json_ok(MissingEventsResBody { events })
}

/// `GET /_matrix/federation/v1/state/{roomId}?event_id=...`
#[handler]
async fn room_state(req: &mut Request, depot: &mut Depot) -> JsonResult<RoomStateResBody> {
    let origin = depot.origin()?.clone();
    let room_id = room_id_param(req)?;
    check_room_access(&origin, &room_id)?;
    let (state_ids, auth_chain_ids) = state_at_requested_event(req, &room_id)?;

    json_ok(RoomStateResBody {
        auth_chain: auth_chain_ids
            .iter()
            .filter_map(|id| room::timeline::outgoing_federation_json(id).ok())
            .collect(),
        pdus: state_ids
            .iter()
            .filter_map(|id| room::timeline::outgoing_federation_json(id).ok())
            .collect(),
    })
}

/// `GET /_matrix/federation/v1/state_ids/{roomId}?event_id=...`
#[handler]
async fn room_state_ids(req: &mut Request, depot: &mut Depot) -> JsonResult<RoomStateIdsResBody> {
    let origin = depot.origin()?.clone();
    let room_id = room_id_param(req)?;
    check_room_access(&origin, &room_id)?;
    let (pdu_ids, auth_chain_ids) = state_at_requested_event(req, &room_id)?;

    json_ok(RoomStateIdsResBody {
        auth_chain_ids,
        pdu_ids,
    })
}

/// The room state before the event named in `event_id`, plus that state's
/// auth chain.
fn state_at_requested_event(
    req: &mut Request,
    room_id: &crate::core::identifiers::RoomId,
) -> AppResult<(Vec<OwnedEventId>, Vec<OwnedEventId>)> {
    let event_id: OwnedEventId = req
        .query::<String>("event_id")
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| MatrixError::missing_param("missing event_id"))?;

    let pdu = data::event::require(&event_id)?;
    if pdu.room_id != *room_id {
        return Err(MatrixError::not_found("event is not in this room").into());
    }
    let rules = data::room::room_version(room_id)?.rules();
    let state = room::state::state_before(&pdu, &rules)?;
    let state_ids: Vec<OwnedEventId> = state.into_values().collect();
    let mut auth_chain_ids: Vec<OwnedEventId> =
        data::event::auth_chain_ids(&state_ids).into_iter().collect();
    auth_chain_ids.sort();
    Ok((state_ids, auth_chain_ids))
}

/// `GET /_matrix/federation/v1/backfill/{roomId}?v=...&limit=...`
#[handler]
async fn backfill(req: &mut Request, depot: &mut Depot) -> JsonResult<BackfillResBody> {
    let origin = depot.origin()?.clone();
    let room_id = room_id_param(req)?;
    check_room_access(&origin, &room_id)?;

    let from: Vec<OwnedEventId> = req
        .queries()
        .get_vec("v")
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.as_str().try_into().ok())
                .collect()
        })
        .unwrap_or_default();
    let limit: usize = req.query("limit").unwrap_or(10);

    let pdus = data::event::backfill(&room_id, &from, limit.min(100))
        .into_iter()
        .filter_map(|pdu| room::timeline::outgoing_federation_json(&pdu.event_id).ok())
        .collect();

    json_ok(BackfillResBody {
        origin: config::server_name().to_owned(),
        origin_server_ts: UnixMillis::now(),
        pdus,
    })
}

/// `GET /_matrix/federation/v1/event_auth/{roomId}/{eventId}`
///
/// Serves the full auth chain, soft-failed ancestors included.
#[handler]
async fn event_auth(req: &mut Request, depot: &mut Depot) -> JsonResult<EventAuthResBody> {
    let origin = depot.origin()?.clone();
    let room_id = room_id_param(req)?;
    let event_id = event_id_param(req)?;
    check_room_access(&origin, &room_id)?;

    let pdu = data::event::require(&event_id)?;
    if pdu.room_id != room_id {
        return Err(MatrixError::not_found("event is not in this room").into());
    }

    let auth_chain = data::event::auth_chain(&[event_id])
        .into_iter()
        .filter_map(|auth_pdu| room::timeline::outgoing_federation_json(&auth_pdu.event_id).ok())
        .collect();
    json_ok(EventAuthResBody { auth_chain })
}

/// `GET /_matrix/federation/v1/event/{eventId}`
#[handler]
async fn get_event(req: &mut Request, depot: &mut Depot) -> JsonResult<EventResBody> {
    let origin = depot.origin()?.clone();
    let event_id = event_id_param(req)?;
    let pdu = data::event::require(&event_id)?;
    check_room_access(&origin, &pdu.room_id)?;

    json_ok(EventResBody {
        origin: config::server_name().to_owned(),
        origin_server_ts: UnixMillis::now(),
        pdus: vec![room::timeline::outgoing_federation_json(&event_id)?],
    })
}
