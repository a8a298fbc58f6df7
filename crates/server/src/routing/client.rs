//! The client-server API surface.

use salvo::prelude::*;
use serde_json::{Value as JsonValue, json};

use crate::core::UnixMillis;
use crate::core::client::membership::{
    InviteUserReqBody, JoinRoomReqBody, JoinRoomResBody, JoinedRoomsResBody, LeaveRoomReqBody,
};
use crate::core::client::message::{Direction, MessagesResBody, SendMessageResBody};
use crate::core::client::room::{CreateRoomReqBody, CreateRoomResBody, RoomPreset};
use crate::core::client::state::SendStateEventResBody;
use crate::core::client::sync::SyncResBody;
use crate::core::events::TimelineEventType;
use crate::core::events::room::{
    HistoryVisibility, JoinRule, RoomCreateEventContent, RoomHistoryVisibilityEventContent,
    RoomJoinRulesEventContent, RoomNameEventContent, RoomPowerLevelsEventContent,
    RoomTopicEventContent,
};
use crate::core::identifiers::{
    OwnedEventId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId,
};
use crate::event::PduBuilder;
use crate::room::timeline;
use crate::{
    AppResult, DepotExt, EmptyResult, JsonResult, MatrixError, config, data, empty_ok, hoops,
    json_ok, membership, room, sync,
};

pub fn router() -> Router {
    let authed = Router::new()
        .hoop(hoops::auth_by_access_token)
        .push(Router::with_path("createRoom").post(create_room))
        .push(Router::with_path("joined_rooms").get(joined_rooms))
        .push(Router::with_path("sync").get(sync_events))
        .push(Router::with_path("knock/{room_id}").post(knock_room))
        .push(
            Router::with_path("rooms/{room_id}")
                .push(Router::with_path("join").post(join_room))
                .push(Router::with_path("leave").post(leave_room))
                .push(Router::with_path("invite").post(invite_user))
                .push(Router::with_path("messages").get(messages))
                .push(Router::with_path("send/{event_type}/{txn_id}").put(send_message))
                .push(
                    Router::with_path("state/{event_type}")
                        .put(send_state_event)
                        .push(Router::with_path("{state_key}").put(send_state_event)),
                )
                .push(Router::with_path("typing/{user_id}").put(send_typing))
                .push(
                    Router::with_path("receipt/{receipt_type}/{event_id}").post(send_receipt),
                ),
        );

    Router::with_path("client")
        .push(Router::with_path("versions").get(versions))
        .push(Router::with_path("v3").push(authed))
}

#[handler]
async fn versions() -> JsonResult<JsonValue> {
    json_ok(json!({"versions": ["v1.6", "v1.7", "v1.8", "v1.9", "v1.10", "v1.11"]}))
}

fn room_id_param(req: &mut Request) -> AppResult<OwnedRoomId> {
    req.param::<String>("room_id")
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| MatrixError::invalid_param("invalid room id").into())
}

/// `POST /_matrix/client/v3/createRoom`
///
/// Emits the room's initial events in order: create, the creator's join,
/// power levels, join rules, history visibility, then the optional
/// extras.
#[handler]
async fn create_room(req: &mut Request, depot: &mut Depot) -> JsonResult<CreateRoomResBody> {
    let authed = depot.authed_user()?.clone();
    let body: CreateRoomReqBody = req.parse_json().await.unwrap_or_default();
    let sender = &authed.user_id;

    let room_version = match &body.room_version {
        Some(version) => version
            .parse()
            .map_err(|_| MatrixError::unsupported_room_version("unknown room version"))?,
        None => config::default_room_version(),
    };
    let rules = room_version.rules();

    let room_id = RoomId::new(config::server_name());
    let published = body.visibility.as_deref() == Some("public");
    data::room::create_room(&room_id, room_version, Some(sender.clone()), published);

    let guard = room::lock_state(&room_id).await;

    let mut create_content = serde_json::to_value(RoomCreateEventContent::new(
        room_version,
        (!rules.implicit_room_creator).then(|| sender.clone()),
    ))?;
    if let Some(JsonValue::Object(extra)) = body.creation_content {
        if let JsonValue::Object(content) = &mut create_content {
            for (key, value) in extra {
                content.entry(key).or_insert(value);
            }
        }
    }
    timeline::build_and_append_pdu(
        PduBuilder {
            event_type: TimelineEventType::RoomCreate,
            content: create_content,
            state_key: Some(String::new()),
            ..Default::default()
        },
        sender,
        &room_id,
        &guard,
    )?;

    timeline::build_and_append_pdu(
        PduBuilder {
            event_type: TimelineEventType::RoomMember,
            content: json!({"membership": "join", "displayname": data::user::display_name(sender)}),
            state_key: Some(sender.as_str().to_owned()),
            ..Default::default()
        },
        sender,
        &room_id,
        &guard,
    )?;

    let mut power_levels = RoomPowerLevelsEventContent::initial(sender.clone());
    if body.preset == Some(RoomPreset::TrustedPrivateChat) {
        for invitee in &body.invite {
            power_levels.users.insert(invitee.clone(), 100);
        }
    }
    timeline::build_and_append_pdu(
        PduBuilder {
            event_type: TimelineEventType::RoomPowerLevels,
            content: serde_json::to_value(&power_levels)?,
            state_key: Some(String::new()),
            ..Default::default()
        },
        sender,
        &room_id,
        &guard,
    )?;

    let join_rule = match body.preset {
        Some(RoomPreset::PublicChat) => JoinRule::Public,
        Some(RoomPreset::PrivateChat) | Some(RoomPreset::TrustedPrivateChat) => JoinRule::Invite,
        None if published => JoinRule::Public,
        None => JoinRule::Invite,
    };
    timeline::build_and_append_pdu(
        PduBuilder {
            event_type: TimelineEventType::RoomJoinRules,
            content: serde_json::to_value(RoomJoinRulesEventContent::new(join_rule))?,
            state_key: Some(String::new()),
            ..Default::default()
        },
        sender,
        &room_id,
        &guard,
    )?;

    timeline::build_and_append_pdu(
        PduBuilder {
            event_type: TimelineEventType::RoomHistoryVisibility,
            content: serde_json::to_value(RoomHistoryVisibilityEventContent {
                history_visibility: HistoryVisibility::Shared,
            })?,
            state_key: Some(String::new()),
            ..Default::default()
        },
        sender,
        &room_id,
        &guard,
    )?;

    if let Some(name) = &body.name {
        timeline::build_and_append_pdu(
            PduBuilder {
                event_type: TimelineEventType::RoomName,
                content: serde_json::to_value(RoomNameEventContent { name: name.clone() })?,
                state_key: Some(String::new()),
                ..Default::default()
            },
            sender,
            &room_id,
            &guard,
        )?;
    }
    if let Some(topic) = &body.topic {
        timeline::build_and_append_pdu(
            PduBuilder {
                event_type: TimelineEventType::RoomTopic,
                content: serde_json::to_value(RoomTopicEventContent {
                    topic: topic.clone(),
                })?,
                state_key: Some(String::new()),
                ..Default::default()
            },
            sender,
            &room_id,
            &guard,
        )?;
    }

    for event in &body.initial_state {
        timeline::build_and_append_pdu(
            PduBuilder {
                event_type: TimelineEventType::from(event.event_type.as_str()),
                content: event.content.clone(),
                state_key: Some(event.state_key.clone()),
                ..Default::default()
            },
            sender,
            &room_id,
            &guard,
        )?;
    }

    drop(guard);

    for invitee in &body.invite {
        if let Err(e) = membership::invite_user(sender, &room_id, invitee, None).await {
            warn!(%invitee, error = %e, "createRoom invite failed");
        }
    }

    json_ok(CreateRoomResBody { room_id })
}

/// `POST /_matrix/client/v3/rooms/{roomId}/join`
#[handler]
async fn join_room(req: &mut Request, depot: &mut Depot) -> JsonResult<JoinRoomResBody> {
    let authed = depot.authed_user()?.clone();
    let room_id = room_id_param(req)?;
    let body: JoinRoomReqBody = req.parse_json().await.unwrap_or_default();
    let servers: Vec<crate::core::identifiers::OwnedServerName> = req
        .queries()
        .get_vec("server_name")
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.as_str().try_into().ok())
                .collect()
        })
        .unwrap_or_default();

    json_ok(membership::join_room(&authed.user_id, &room_id, body.reason, &servers).await?)
}

/// `POST /_matrix/client/v3/rooms/{roomId}/leave`
#[handler]
async fn leave_room(req: &mut Request, depot: &mut Depot) -> EmptyResult {
    let authed = depot.authed_user()?.clone();
    let room_id = room_id_param(req)?;
    let body: LeaveRoomReqBody = req.parse_json().await.unwrap_or_default();
    membership::leave_room(&authed.user_id, &room_id, body.reason).await?;
    empty_ok()
}

/// `POST /_matrix/client/v3/rooms/{roomId}/invite`
#[handler]
async fn invite_user(req: &mut Request, depot: &mut Depot) -> EmptyResult {
    let authed = depot.authed_user()?.clone();
    let room_id = room_id_param(req)?;
    let body: InviteUserReqBody = req.parse_json().await?;
    membership::invite_user(&authed.user_id, &room_id, &body.user_id, body.reason).await?;
    empty_ok()
}

/// `POST /_matrix/client/v3/knock/{roomId}`
#[handler]
async fn knock_room(req: &mut Request, depot: &mut Depot) -> JsonResult<JoinRoomResBody> {
    let authed = depot.authed_user()?.clone();
    let room_id = room_id_param(req)?;
    let body: JoinRoomReqBody = req.parse_json().await.unwrap_or_default();
    membership::knock_room(&authed.user_id, &room_id, body.reason, &[]).await?;
    json_ok(JoinRoomResBody::new(room_id))
}

/// `GET /_matrix/client/v3/joined_rooms`
#[handler]
async fn joined_rooms(depot: &mut Depot) -> JsonResult<JoinedRoomsResBody> {
    let authed = depot.authed_user()?;
    json_ok(JoinedRoomsResBody {
        joined_rooms: data::room::joined_rooms(&authed.user_id),
    })
}

/// `PUT /_matrix/client/v3/rooms/{roomId}/send/{eventType}/{txnId}`
#[handler]
async fn send_message(req: &mut Request, depot: &mut Depot) -> JsonResult<SendMessageResBody> {
    let authed = depot.authed_user()?.clone();
    let room_id = room_id_param(req)?;
    let event_type = req
        .param::<String>("event_type")
        .ok_or_else(|| MatrixError::missing_param("missing event type"))?;
    let txn_id: OwnedTransactionId = req
        .param::<String>("txn_id")
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| MatrixError::invalid_param("invalid transaction id"))?;
    let content: JsonValue = req
        .parse_json()
        .await
        .map_err(|_| MatrixError::not_json("request body is not JSON"))?;

    // Replays of a transaction return the original event.
    if let Some(Some(event_id)) = crate::transaction_id::existing_txn_id(
        &txn_id,
        &authed.user_id,
        Some(&authed.device_id),
    ) {
        return json_ok(SendMessageResBody { event_id });
    }

    let guard = room::lock_state(&room_id).await;
    let pdu = timeline::build_and_append_pdu(
        PduBuilder {
            event_type: TimelineEventType::from(event_type.as_str()),
            content,
            ..Default::default()
        },
        &authed.user_id,
        &room_id,
        &guard,
    )?;
    drop(guard);

    crate::transaction_id::add_txn_id(
        &txn_id,
        &authed.user_id,
        Some(&authed.device_id),
        Some(pdu.event_id.clone()),
    );
    json_ok(SendMessageResBody {
        event_id: pdu.event_id.clone(),
    })
}

/// `PUT /_matrix/client/v3/rooms/{roomId}/state/{eventType}/{stateKey}`
///
/// The state key segment is optional and defaults to the empty string.
#[handler]
async fn send_state_event(
    req: &mut Request,
    depot: &mut Depot,
) -> JsonResult<SendStateEventResBody> {
    let authed = depot.authed_user()?.clone();
    let room_id = room_id_param(req)?;
    let event_type = req
        .param::<String>("event_type")
        .ok_or_else(|| MatrixError::missing_param("missing event type"))?;
    let state_key = req.param::<String>("state_key").unwrap_or_default();
    let content: JsonValue = req
        .parse_json()
        .await
        .map_err(|_| MatrixError::not_json("request body is not JSON"))?;

    let guard = room::lock_state(&room_id).await;
    let pdu = timeline::build_and_append_pdu(
        PduBuilder {
            event_type: TimelineEventType::from(event_type.as_str()),
            content,
            state_key: Some(state_key),
            ..Default::default()
        },
        &authed.user_id,
        &room_id,
        &guard,
    )?;

    json_ok(SendStateEventResBody {
        event_id: pdu.event_id.clone(),
    })
}

/// `GET /_matrix/client/v3/sync`
#[handler]
async fn sync_events(req: &mut Request, depot: &mut Depot) -> JsonResult<SyncResBody> {
    let authed = depot.authed_user()?.clone();
    let args = sync::SyncArgs {
        since: req.query("since"),
        timeout_ms: req.query("timeout"),
        full_state: req.query("full_state").unwrap_or(false),
        use_state_after: req.query("use_state_after").unwrap_or(false),
    };
    json_ok(sync::sync_events(&authed.user_id, &authed.device_id, args).await?)
}

/// `GET /_matrix/client/v3/rooms/{roomId}/messages`
#[handler]
async fn messages(req: &mut Request, depot: &mut Depot) -> JsonResult<MessagesResBody> {
    let authed = depot.authed_user()?.clone();
    let room_id = room_id_param(req)?;
    if !data::room::is_joined(&authed.user_id, &room_id) {
        return Err(MatrixError::forbidden("you are not in this room").into());
    }

    let dir = match req.query::<String>("dir").as_deref() {
        Some("f") => Direction::Forward,
        _ => Direction::Backward,
    };
    let limit: usize = req.query("limit").unwrap_or(10);
    let limit = limit.min(100);
    let from: Option<String> = req.query("from");
    let from_sn = from
        .as_deref()
        .and_then(|token| token.strip_prefix('s'))
        .and_then(|rest| rest.parse::<crate::core::Seqnum>().ok());

    let (chunk, end) = match dir {
        Direction::Backward => {
            let until = from_sn.unwrap_or_else(|| data::event::latest_sn(&room_id));
            let events = data::event::events_before(&room_id, until, limit);
            let end = events.last().map(|(sn, _)| format!("s{}", sn - 1));
            (events, end)
        }
        Direction::Forward => {
            let since = from_sn.unwrap_or(0);
            let events = data::event::events_since(&room_id, since, limit);
            let end = events.last().map(|(sn, _)| format!("s{sn}"));
            (events, end)
        }
    };

    json_ok(MessagesResBody {
        start: from.unwrap_or_else(|| "s0".to_owned()),
        end,
        chunk: chunk
            .into_iter()
            .map(|(_, pdu)| pdu.to_room_event())
            .collect(),
        state: Vec::new(),
    })
}

/// `PUT /_matrix/client/v3/rooms/{roomId}/typing/{userId}`
#[handler]
async fn send_typing(req: &mut Request, depot: &mut Depot) -> EmptyResult {
    let authed = depot.authed_user()?.clone();
    let room_id = room_id_param(req)?;
    let user_id: OwnedUserId = req
        .param::<String>("user_id")
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| MatrixError::invalid_param("invalid user id"))?;
    if user_id != authed.user_id {
        return Err(MatrixError::forbidden("cannot type for another user").into());
    }
    if !data::room::is_joined(&authed.user_id, &room_id) {
        return Err(MatrixError::forbidden("you are not in this room").into());
    }

    #[derive(serde::Deserialize, Default)]
    struct TypingBody {
        #[serde(default)]
        typing: bool,
        #[serde(default)]
        timeout: Option<u64>,
    }
    let body: TypingBody = req.parse_json().await.unwrap_or_default();

    if body.typing {
        let timeout = body
            .timeout
            .unwrap_or(room::typing::TYPING_TIMEOUT_MS)
            .min(room::typing::TYPING_TIMEOUT_MS);
        room::typing::add_typing(
            &authed.user_id,
            &room_id,
            UnixMillis::now().saturating_add(timeout),
        )?;
    } else {
        room::typing::remove_typing(&authed.user_id, &room_id)?;
    }

    let edu = crate::core::federation::transaction::Edu::Typing(
        crate::core::events::edu::TypingContent {
            room_id: room_id.clone(),
            user_id: authed.user_id.clone(),
            typing: body.typing,
        },
    );
    crate::sending::send_edu_room(&room_id, &edu)?;
    empty_ok()
}

/// `POST /_matrix/client/v3/rooms/{roomId}/receipt/{receiptType}/{eventId}`
#[handler]
async fn send_receipt(req: &mut Request, depot: &mut Depot) -> EmptyResult {
    let authed = depot.authed_user()?.clone();
    let room_id = room_id_param(req)?;
    let event_id: OwnedEventId = req
        .param::<String>("event_id")
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| MatrixError::invalid_param("invalid event id"))?;
    if !data::room::is_joined(&authed.user_id, &room_id) {
        return Err(MatrixError::forbidden("you are not in this room").into());
    }

    let ts = UnixMillis::now();
    room::receipt::update_read(&authed.user_id, &room_id, &event_id, Some(ts))?;

    use crate::core::events::edu::{Receipt, ReceiptContent, ReceiptData, ReceiptMap};
    let mut read = std::collections::BTreeMap::new();
    read.insert(
        authed.user_id.clone(),
        ReceiptData {
            data: Receipt { ts: Some(ts) },
            event_ids: vec![event_id],
        },
    );
    let mut content = std::collections::BTreeMap::new();
    content.insert(room_id.clone(), ReceiptMap { read });
    let edu = crate::core::federation::transaction::Edu::Receipt(ReceiptContent(content));
    crate::sending::send_edu_room(&room_id, &edu)?;
    empty_ok()
}
