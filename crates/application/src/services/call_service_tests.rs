//! 通话信令测试

use chrono::Duration;
use domain::{
    CallFailure, CallMedium, CallStatus, ChatType, DomainError, ParticipantCallStatus,
    ServerEvent, UserId,
};
use serde_json::json;

use super::call_service::{InitiateCallRequest, RelayOutcome};
use super::test_support::{drain, named, user, Harness};
use crate::{error::ApplicationError, repository::CallRepository};

fn request(caller_id: UserId, chat_id: domain::ChatId, recipients: &[UserId]) -> InitiateCallRequest {
    InitiateCallRequest {
        caller_id,
        chat_id,
        recipient_ids: recipients.to_vec(),
        medium: CallMedium::Video,
    }
}

fn failure_reasons(events: &[ServerEvent]) -> Vec<CallFailure> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::CallFailed { reason, .. } => Some(*reason),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn offline_recipient_makes_call_missed() {
    let h = Harness::new();
    let (x, y) = (user(), user());
    let chat = h.chat(ChatType::Direct, x, &[y]).await;
    let (_session, mut x_rx) = h.connect(x).await;

    let call = h.core.calls.initiate(request(x, chat.id, &[y])).await.unwrap();

    assert_eq!(call.status, CallStatus::Missed);
    assert_eq!(call.participants[0].status, ParticipantCallStatus::Missed);
    assert_eq!(
        failure_reasons(&drain(&mut x_rx)),
        vec![CallFailure::RecipientUnreachable]
    );
    assert_eq!(h.notifier.notified("incoming-call"), vec![y]);
}

#[tokio::test]
async fn accept_end_then_decline_is_rejected() {
    let h = Harness::new();
    let (x, y) = (user(), user());
    let chat = h.chat(ChatType::Direct, x, &[y]).await;
    let (_xs, mut x_rx) = h.connect(x).await;
    let (_ys, mut y_rx) = h.connect(y).await;

    let call = h.core.calls.initiate(request(x, chat.id, &[])).await.unwrap();
    assert_eq!(call.status, CallStatus::Ringing);
    assert_eq!(named(&drain(&mut y_rx), "incoming-call").len(), 1);

    let accepted = h.core.calls.accept(call.id, y).await.unwrap();
    assert_eq!(accepted.status, CallStatus::Ongoing);
    assert_eq!(named(&drain(&mut x_rx), "call-accepted").len(), 1);

    h.clock.advance(Duration::seconds(90));
    let ended = h.core.calls.end(call.id, x).await.unwrap();
    assert_eq!(ended.status, CallStatus::Ended);
    assert_eq!(ended.duration_secs, Some(90));
    assert_eq!(named(&drain(&mut y_rx), "call-ended").len(), 1);

    let err = h.core.calls.decline(call.id, y).await.unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::InvalidCallState {
            status: CallStatus::Ended,
            ..
        })
    ));
    let stored = CallRepository::find_by_id(h.store.as_ref(), call.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.ended_at, ended.ended_at);
    assert_eq!(stored.status, CallStatus::Ended);
}

#[tokio::test]
async fn busy_recipient_fails_call() {
    let h = Harness::new();
    let (x, y, z) = (user(), user(), user());
    let first = h.chat(ChatType::Direct, z, &[y]).await;
    let second = h.chat(ChatType::Direct, x, &[y]).await;
    let (_xs, mut x_rx) = h.connect(x).await;
    let (_ys, _y_rx) = h.connect(y).await;
    let (_zs, _z_rx) = h.connect(z).await;

    let ongoing = h.core.calls.initiate(request(z, first.id, &[y])).await.unwrap();
    h.core.calls.accept(ongoing.id, y).await.unwrap();

    let call = h
        .core
        .calls
        .initiate(request(x, second.id, &[y]))
        .await
        .unwrap();

    assert_eq!(call.status, CallStatus::Missed);
    assert_eq!(call.participants[0].status, ParticipantCallStatus::Busy);
    assert_eq!(
        failure_reasons(&drain(&mut x_rx)),
        vec![CallFailure::RecipientBusy]
    );
}

#[tokio::test]
async fn group_call_rings_reachable_members() {
    let h = Harness::new();
    let (x, online, offline) = (user(), user(), user());
    let chat = h.chat(ChatType::Group, x, &[online, offline]).await;
    let (_xs, mut x_rx) = h.connect(x).await;
    let (_os, mut online_rx) = h.connect(online).await;

    let call = h.core.calls.initiate(request(x, chat.id, &[])).await.unwrap();

    assert_eq!(call.status, CallStatus::Ringing);
    assert_eq!(
        call.participant(offline).map(|p| p.status),
        Some(ParticipantCallStatus::Missed)
    );
    assert_eq!(named(&drain(&mut online_rx), "incoming-call").len(), 1);
    assert!(failure_reasons(&drain(&mut x_rx)).is_empty());
}

#[tokio::test]
async fn recipients_must_belong_to_chat() {
    let h = Harness::new();
    let (x, y) = (user(), user());
    let chat = h.chat(ChatType::Direct, x, &[y]).await;

    let err = h
        .core
        .calls
        .initiate(request(x, chat.id, &[user()]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::InvalidArgument { .. })
    ));
}

#[tokio::test]
async fn relay_is_routed_by_membership() {
    let h = Harness::new();
    let (x, y, z) = (user(), user(), user());
    let chat = h.chat(ChatType::Group, x, &[y, z]).await;
    let (_xs, _x_rx) = h.connect(x).await;
    let (_ys, mut y_rx) = h.connect(y).await;

    let call = h.core.calls.initiate(request(x, chat.id, &[y])).await.unwrap();
    let offer = json!({ "type": "offer", "sdp": "v=0" });

    let outcome = h
        .core
        .calls
        .relay_signal(call.id, x, y, offer.clone())
        .await
        .unwrap();
    assert_eq!(outcome, RelayOutcome::Delivered);
    let events = drain(&mut y_rx);
    let relayed = named(&events, "signal-relay");
    assert_eq!(relayed.len(), 1);
    match relayed[0] {
        ServerEvent::SignalRelay {
            from_user_id,
            payload,
            ..
        } => {
            assert_eq!(*from_user_id, x);
            assert_eq!(payload, &offer);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let err = h
        .core
        .calls
        .relay_signal(call.id, x, z, offer.clone())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::NotCallParticipant)
    ));

    h.core.calls.end(call.id, x).await.unwrap();
    let err = h
        .core
        .calls
        .relay_signal(call.id, x, y, offer)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::InvalidCallState { .. })
    ));
}

#[tokio::test]
async fn relay_to_offline_member_is_unreachable() {
    let h = Harness::new();
    let (x, y) = (user(), user());
    let chat = h.chat(ChatType::Direct, x, &[y]).await;
    let (_xs, _x_rx) = h.connect(x).await;
    let (ys, _y_rx) = h.connect(y).await;

    let call = h.core.calls.initiate(request(x, chat.id, &[y])).await.unwrap();
    h.core.presence.unregister(ys).await;

    let outcome = h
        .core
        .calls
        .relay_signal(call.id, x, y, json!({ "candidate": "a=1" }))
        .await
        .unwrap();
    assert_eq!(outcome, RelayOutcome::Unreachable);
}

#[tokio::test]
async fn unanswered_call_times_out_on_sweep() {
    let h = Harness::new();
    let (x, y) = (user(), user());
    let chat = h.chat(ChatType::Direct, x, &[y]).await;
    let (_xs, mut x_rx) = h.connect(x).await;
    let (_ys, mut y_rx) = h.connect(y).await;

    let call = h.core.calls.initiate(request(x, chat.id, &[y])).await.unwrap();

    h.clock.advance(Duration::seconds(10));
    assert_eq!(h.core.sweeper.sweep_once().await.unwrap().timed_out_calls, 0);

    h.clock.advance(Duration::seconds(40));
    assert_eq!(h.core.sweeper.sweep_once().await.unwrap().timed_out_calls, 1);
    assert_eq!(h.core.sweeper.sweep_once().await.unwrap().timed_out_calls, 0);

    let stored = CallRepository::find_by_id(h.store.as_ref(), call.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, CallStatus::Missed);
    assert_eq!(
        failure_reasons(&drain(&mut x_rx)),
        vec![CallFailure::NoAnswer]
    );
    assert_eq!(named(&drain(&mut y_rx), "call-ended").len(), 1);
}
