use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
};
use tracing::warn;
use uuid::Uuid;

use huddle_db::{Database, models::GroupRow, parse_timestamp};
use huddle_gateway::Dispatcher;
use huddle_types::api::{
    AddMembersRequest, AddMembersResponse, Claims, CreateGroupRequest, GroupInfoResponse,
    GroupOverview, LeaveGroupResponse, UserSummary,
};
use huddle_types::events::GatewayEvent;
use huddle_types::models::Group;

use crate::error::ApiError;
use crate::messages::row_to_payload;
use crate::state::{AppState, blocking};

fn parse_group(row: GroupRow) -> Group {
    Group {
        id: row.id.parse().unwrap_or_else(|e| {
            warn!("Corrupt group id '{}': {}", row.id, e);
            Uuid::default()
        }),
        admin_id: row.admin_id.parse().unwrap_or_else(|e| {
            warn!("Corrupt admin id '{}' on group '{}': {}", row.admin_id, row.id, e);
            Uuid::default()
        }),
        name: row.name,
        created_at: parse_timestamp(&row.created_at),
    }
}

/// Create a group: the creator becomes admin, invitees (deduplicated, plus
/// the creator) get membership rows, every member's live connection is
/// subscribed to the new room, and the room hears `new_group`.
pub async fn create(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    creator: Uuid,
    req: CreateGroupRequest,
) -> Result<Group, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::Validation("group name cannot be empty"));
    }

    let mut members: Vec<Uuid> = Vec::with_capacity(req.user_ids.len() + 1);
    let mut seen = HashSet::new();
    for user_id in req.user_ids.iter().copied().chain([creator]) {
        if seen.insert(user_id) {
            members.push(user_id);
        }
    }

    let group_id = Uuid::new_v4();
    let members_for_insert = members.clone();
    let name_for_insert = name.clone();
    let group = blocking(db.clone(), move |db| {
        for user_id in &members_for_insert {
            db.get_user_by_id(&user_id.to_string())?
                .ok_or(ApiError::NotFound("user"))?;
        }
        let member_ids: Vec<String> =
            members_for_insert.iter().map(|id| id.to_string()).collect();
        db.create_group_with_members(
            &group_id.to_string(),
            &name_for_insert,
            &creator.to_string(),
            &member_ids,
        )?;
        db.get_group(&group_id.to_string())?
            .ok_or(ApiError::NotFound("group"))
    })
    .await?;

    for user_id in members {
        dispatcher.subscribe_user(user_id, group_id).await;
    }
    dispatcher
        .to_room(
            group_id,
            GatewayEvent::NewGroup {
                id: group_id,
                name,
                messages: None,
                messages_count: None,
                users_count: None,
            },
        )
        .await;

    Ok(parse_group(group))
}

/// "List my groups": each group with its visible history and counts, most
/// recently active first.
pub async fn list(db: &Arc<Database>, viewer: Uuid) -> Result<Vec<GroupOverview>, ApiError> {
    let raw = blocking(db.clone(), move |db| {
        let groups = db.groups_for_user(&viewer.to_string())?;
        let mut out = Vec::with_capacity(groups.len());
        for group in groups {
            let messages = db.messages_for_group(&group.id, false)?;
            let users_count = db.count_members(&group.id)?;
            out.push((group, messages, users_count));
        }
        Ok(out)
    })
    .await?;

    let mut overviews: Vec<GroupOverview> = raw
        .into_iter()
        .map(|(group, rows, users_count)| {
            let group = parse_group(group);
            let messages: Vec<_> = rows
                .into_iter()
                .map(|row| row_to_payload(row, Some(viewer)))
                .collect();
            let sort_date = messages
                .last()
                .map(|m| m.created_at)
                .unwrap_or(group.created_at);
            GroupOverview {
                id: group.id,
                name: group.name,
                created_at: group.created_at,
                sort_date,
                messages_count: messages.len(),
                messages,
                users_count,
            }
        })
        .collect();

    overviews.sort_by(|a, b| b.sort_date.cmp(&a.sort_date));
    Ok(overviews)
}

/// Group name, the members other than the viewer, and whether the viewer is
/// the admin.
pub async fn info(
    db: &Arc<Database>,
    viewer: Uuid,
    group_id: Uuid,
) -> Result<GroupInfoResponse, ApiError> {
    let (group, members) = blocking(db.clone(), move |db| {
        let group = db
            .get_group(&group_id.to_string())?
            .ok_or(ApiError::NotFound("group"))?;
        let members = db.users_in_group(&group_id.to_string())?;
        Ok((group, members))
    })
    .await?;

    let group = parse_group(group);
    let users = members
        .into_iter()
        .filter(|row| row.id != viewer.to_string())
        .map(|row| UserSummary {
            id: row.id.parse().unwrap_or_else(|e| {
                warn!("Corrupt user id '{}': {}", row.id, e);
                Uuid::default()
            }),
            username: row.username,
        })
        .collect();

    Ok(GroupInfoResponse {
        group_id: group.id,
        name: group.name,
        is_admin: group.admin_id == viewer,
        users,
    })
}

/// Leave a group. A regular member just loses their membership; the admin
/// leaving deletes the whole group — messages, memberships and the row
/// itself in one transaction — and the room hears `delete_group` before its
/// runtime state is torn down.
pub async fn leave(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    user: Uuid,
    group_id: Uuid,
) -> Result<LeaveGroupResponse, ApiError> {
    let is_admin = blocking(db.clone(), move |db| {
        let group = db
            .get_group(&group_id.to_string())?
            .ok_or(ApiError::NotFound("group"))?;
        if !db.membership_exists(&group_id.to_string(), &user.to_string())? {
            return Err(ApiError::NotFound("membership"));
        }

        if group.admin_id == user.to_string() {
            db.delete_group_cascade(&group_id.to_string())?;
            Ok(true)
        } else {
            db.remove_membership(&group_id.to_string(), &user.to_string())?;
            Ok(false)
        }
    })
    .await?;

    if is_admin {
        dispatcher
            .to_room(group_id, GatewayEvent::DeleteGroup { id: group_id })
            .await;
        dispatcher.rooms().drop_room(group_id).await;
    } else {
        dispatcher.rooms().unsubscribe(group_id, user).await;
    }

    Ok(LeaveGroupResponse {
        deleted_group: is_admin,
    })
}

/// Admin-only. Adds the set difference between the requested and existing
/// members, subscribes their live connections, and replays the group's
/// history to the room — except to the admin who triggered it.
pub async fn add_members(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    requester: Uuid,
    group_id: Uuid,
    req: AddMembersRequest,
) -> Result<AddMembersResponse, ApiError> {
    let (group_name, added, history, users_count) = blocking(db.clone(), move |db| {
        let group = db
            .get_group(&group_id.to_string())?
            .ok_or(ApiError::NotFound("group"))?;
        if group.admin_id != requester.to_string() {
            return Err(ApiError::Forbidden("only the admin can add members"));
        }

        for user_id in &req.user_ids {
            db.get_user_by_id(&user_id.to_string())?
                .ok_or(ApiError::NotFound("user"))?;
        }

        let existing: HashSet<String> =
            db.member_ids(&group_id.to_string())?.into_iter().collect();
        let mut to_add: Vec<Uuid> = Vec::new();
        let mut seen = HashSet::new();
        for user_id in req.user_ids.iter().copied() {
            if seen.insert(user_id) && !existing.contains(&user_id.to_string()) {
                to_add.push(user_id);
            }
        }

        if to_add.is_empty() {
            return Ok((group.name, to_add, Vec::new(), 0));
        }

        let ids: Vec<String> = to_add.iter().map(|id| id.to_string()).collect();
        db.add_memberships(&group_id.to_string(), &ids)?;

        let history = db.messages_for_group(&group_id.to_string(), false)?;
        let users_count = db.count_members(&group_id.to_string())?;
        Ok((group.name, to_add, history, users_count))
    })
    .await?;

    if added.is_empty() {
        return Ok(AddMembersResponse { added });
    }

    for user_id in &added {
        dispatcher.subscribe_user(*user_id, group_id).await;
    }

    let messages: Vec<_> = history
        .into_iter()
        .map(|row| row_to_payload(row, None))
        .collect();
    dispatcher
        .to_room_except(
            group_id,
            GatewayEvent::NewGroup {
                id: group_id,
                name: group_name,
                messages_count: Some(messages.len()),
                messages: Some(messages),
                users_count: Some(users_count),
            },
            requester,
        )
        .await;

    Ok(AddMembersResponse { added })
}

/// Admin-only removal of a non-admin member. The removed user is told
/// directly — they are no longer in the room, so the room hears nothing.
pub async fn remove_member(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    requester: Uuid,
    group_id: Uuid,
    target: Uuid,
) -> Result<LeaveGroupResponse, ApiError> {
    blocking(db.clone(), move |db| {
        let group = db
            .get_group(&group_id.to_string())?
            .ok_or(ApiError::NotFound("group"))?;
        if group.admin_id != requester.to_string() {
            return Err(ApiError::Forbidden("only the admin can remove members"));
        }
        if group.admin_id == target.to_string() {
            return Err(ApiError::Forbidden("the admin cannot be removed"));
        }
        if !db.membership_exists(&group_id.to_string(), &target.to_string())? {
            return Err(ApiError::NotFound("membership"));
        }
        db.remove_membership(&group_id.to_string(), &target.to_string())?;
        Ok(())
    })
    .await?;

    dispatcher.rooms().unsubscribe(group_id, target).await;
    dispatcher
        .to_user(target, GatewayEvent::DeleteGroup { id: group_id })
        .await;

    Ok(LeaveGroupResponse {
        deleted_group: false,
    })
}

// -- Handlers --

pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(axum::http::StatusCode, Json<Group>), ApiError> {
    let group = create(&state.db, &state.dispatcher, claims.sub, req).await?;
    Ok((axum::http::StatusCode::CREATED, Json(group)))
}

pub async fn my_groups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<GroupOverview>>, ApiError> {
    Ok(Json(list(&state.db, claims.sub).await?))
}

pub async fn group_info(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<GroupInfoResponse>, ApiError> {
    Ok(Json(info(&state.db, claims.sub, group_id).await?))
}

pub async fn leave_group(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<LeaveGroupResponse>, ApiError> {
    Ok(Json(leave(&state.db, &state.dispatcher, claims.sub, group_id).await?))
}

pub async fn add_group_members(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddMembersRequest>,
) -> Result<Json<AddMembersResponse>, ApiError> {
    Ok(Json(add_members(&state.db, &state.dispatcher, claims.sub, group_id, req).await?))
}

pub async fn remove_group_member(
    State(state): State<AppState>,
    Path((group_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<LeaveGroupResponse>, ApiError> {
    Ok(Json(
        remove_member(&state.db, &state.dispatcher, claims.sub, group_id, user_id).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages;
    use huddle_gateway::{ConnectionRegistry, RoomIndex};
    use huddle_types::api::SendMessageRequest;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn fixture() -> (Arc<Database>, Dispatcher) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(RoomIndex::new()),
        );
        (db, dispatcher)
    }

    fn seed_user(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), name, "hash").unwrap();
        id
    }

    async fn connect(dispatcher: &Dispatcher, user: Uuid) -> UnboundedReceiver<GatewayEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.admit(user, tx).await;
        rx
    }

    async fn trip(db: &Arc<Database>, dispatcher: &Dispatcher, admin: Uuid, invitees: &[Uuid]) -> Group {
        create(
            db,
            dispatcher,
            admin,
            CreateGroupRequest {
                name: "trip".into(),
                user_ids: invitees.to_vec(),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn creator_and_invitees_get_membership_rows_once() {
        let (db, dispatcher) = fixture();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");

        // The creator appears both implicitly and in the invite list.
        let group = create(
            &db,
            &dispatcher,
            alice,
            CreateGroupRequest {
                name: "trip".into(),
                user_ids: vec![bob, alice, bob],
            },
        )
        .await
        .unwrap();

        assert_eq!(group.admin_id, alice);
        assert_eq!(db.count_members(&group.id.to_string()).unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_invitee_creates_nothing() {
        let (db, dispatcher) = fixture();
        let alice = seed_user(&db, "alice");

        let result = create(
            &db,
            &dispatcher,
            alice,
            CreateGroupRequest {
                name: "trip".into(),
                user_ids: vec![Uuid::new_v4()],
            },
        )
        .await;

        assert!(matches!(result, Err(ApiError::NotFound("user"))));
        assert!(db.groups_for_user(&alice.to_string()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_the_admin_may_manage_membership() {
        let (db, dispatcher) = fixture();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let carol = seed_user(&db, "carol");
        let group = trip(&db, &dispatcher, alice, &[bob]).await;

        let add = add_members(
            &db,
            &dispatcher,
            bob,
            group.id,
            AddMembersRequest { user_ids: vec![carol] },
        )
        .await;
        assert!(matches!(add, Err(ApiError::Forbidden(_))));

        let remove = remove_member(&db, &dispatcher, bob, group.id, alice).await;
        assert!(matches!(remove, Err(ApiError::Forbidden(_))));

        // The membership table is untouched.
        assert_eq!(db.count_members(&group.id.to_string()).unwrap(), 2);
    }

    #[tokio::test]
    async fn admin_leave_cascades_and_notifies_the_room_first() {
        let (db, dispatcher) = fixture();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let carol = seed_user(&db, "carol");

        let mut bob_rx = connect(&dispatcher, bob).await;
        let mut carol_rx = connect(&dispatcher, carol).await;
        let group = trip(&db, &dispatcher, alice, &[bob, carol]).await;
        let _ = bob_rx.try_recv();
        let _ = carol_rx.try_recv();

        messages::send(
            &db,
            &dispatcher,
            bob,
            group.id,
            SendMessageRequest { text: "hi".into(), reply_id: None },
        )
        .await
        .unwrap();
        let _ = carol_rx.try_recv();

        let left = leave(&db, &dispatcher, alice, group.id).await.unwrap();
        assert!(left.deleted_group);

        for rx in [&mut bob_rx, &mut carol_rx] {
            match rx.try_recv().unwrap() {
                GatewayEvent::DeleteGroup { id } => assert_eq!(id, group.id),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        assert!(db.get_group(&group.id.to_string()).unwrap().is_none());
        assert_eq!(db.count_members(&group.id.to_string()).unwrap(), 0);
        assert!(db.messages_for_group(&group.id.to_string(), false).unwrap().is_empty());
        assert!(dispatcher.rooms().members_of(group.id).await.is_empty());
    }

    #[tokio::test]
    async fn member_leave_keeps_the_group_alive() {
        let (db, dispatcher) = fixture();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let group = trip(&db, &dispatcher, alice, &[bob]).await;

        let left = leave(&db, &dispatcher, bob, group.id).await.unwrap();
        assert!(!left.deleted_group);
        assert!(db.get_group(&group.id.to_string()).unwrap().is_some());
        assert_eq!(db.count_members(&group.id.to_string()).unwrap(), 1);

        // Leaving twice: the membership no longer exists.
        let again = leave(&db, &dispatcher, bob, group.id).await;
        assert!(matches!(again, Err(ApiError::NotFound("membership"))));
    }

    #[tokio::test]
    async fn removed_member_is_told_directly_not_via_the_room() {
        let (db, dispatcher) = fixture();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let carol = seed_user(&db, "carol");

        let mut bob_rx = connect(&dispatcher, bob).await;
        let mut carol_rx = connect(&dispatcher, carol).await;
        let group = trip(&db, &dispatcher, alice, &[bob, carol]).await;
        let _ = bob_rx.try_recv();
        let _ = carol_rx.try_recv();

        remove_member(&db, &dispatcher, alice, group.id, carol).await.unwrap();

        match carol_rx.try_recv().unwrap() {
            GatewayEvent::DeleteGroup { id } => assert_eq!(id, group.id),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(db.count_members(&group.id.to_string()).unwrap(), 2);
    }

    #[tokio::test]
    async fn add_members_replays_history_to_the_room_except_the_admin() {
        let (db, dispatcher) = fixture();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let carol = seed_user(&db, "carol");

        let mut alice_rx = connect(&dispatcher, alice).await;
        let group = trip(&db, &dispatcher, alice, &[bob]).await;
        let _ = alice_rx.try_recv();

        messages::send(
            &db,
            &dispatcher,
            alice,
            group.id,
            SendMessageRequest { text: "welcome".into(), reply_id: None },
        )
        .await
        .unwrap();

        let mut carol_rx = connect(&dispatcher, carol).await;
        let added = add_members(
            &db,
            &dispatcher,
            alice,
            group.id,
            AddMembersRequest { user_ids: vec![carol, bob] },
        )
        .await
        .unwrap();
        assert_eq!(added.added, vec![carol]);

        match carol_rx.try_recv().unwrap() {
            GatewayEvent::NewGroup { id, messages, users_count, .. } => {
                assert_eq!(id, group.id);
                assert_eq!(messages.unwrap().len(), 1);
                assert_eq!(users_count, Some(3));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // The acting admin gets no echo.
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn overview_sorts_by_latest_activity() {
        let (db, dispatcher) = fixture();
        let alice = seed_user(&db, "alice");

        let quiet = trip(&db, &dispatcher, alice, &[]).await;
        let busy = trip(&db, &dispatcher, alice, &[]).await;
        messages::send(
            &db,
            &dispatcher,
            alice,
            busy.id,
            SendMessageRequest { text: "ping".into(), reply_id: None },
        )
        .await
        .unwrap();

        let overviews = list(&db, alice).await.unwrap();
        assert_eq!(overviews.len(), 2);
        assert_eq!(overviews[0].id, busy.id);
        assert_eq!(overviews[0].messages_count, 1);
        assert_eq!(overviews[1].id, quiet.id);

        let details = info(&db, alice, quiet.id).await.unwrap();
        assert!(details.is_admin);
        assert!(details.users.is_empty());
    }
}
