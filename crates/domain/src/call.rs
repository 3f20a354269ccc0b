//! 通话记录与状态机
//!
//! 整体状态：`Initiated → Ringing → {Ongoing | Declined | Missed}`，`Ongoing → Ended`，
//! 振铃中挂断也进入 `Ended`。终态不可再迁移。

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{CallId, ChatId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMedium {
    Audio,
    Video,
}

impl CallMedium {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallMedium::Audio => "audio",
            CallMedium::Video => "video",
        }
    }
}

impl FromStr for CallMedium {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(CallMedium::Audio),
            "video" => Ok(CallMedium::Video),
            other => Err(DomainError::invalid_argument(
                "medium",
                format!("unknown call medium {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Ongoing,
    Declined,
    Missed,
    Ended,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Declined | CallStatus::Missed | CallStatus::Ended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Ongoing => "ongoing",
            CallStatus::Declined => "declined",
            CallStatus::Missed => "missed",
            CallStatus::Ended => "ended",
        }
    }
}

impl FromStr for CallStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(CallStatus::Initiated),
            "ringing" => Ok(CallStatus::Ringing),
            "ongoing" => Ok(CallStatus::Ongoing),
            "declined" => Ok(CallStatus::Declined),
            "missed" => Ok(CallStatus::Missed),
            "ended" => Ok(CallStatus::Ended),
            other => Err(DomainError::invalid_argument(
                "status",
                format!("unknown call status {other}"),
            )),
        }
    }
}

/// 单个参与者的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantCallStatus {
    Ringing,
    Accepted,
    Declined,
    Missed,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallParticipant {
    pub user_id: UserId,
    pub status: ParticipantCallStatus,
    pub responded_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub chat_id: ChatId,
    pub initiator: UserId,
    pub medium: CallMedium,
    /// 被叫方列表（不含主叫）
    pub participants: Vec<CallParticipant>,
    pub status: CallStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub duration_secs: Option<i64>,
    #[serde(skip)]
    pub version: i64,
}

impl Call {
    pub fn new(
        id: CallId,
        chat_id: ChatId,
        initiator: UserId,
        recipients: impl IntoIterator<Item = UserId>,
        medium: CallMedium,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        let mut participants: Vec<CallParticipant> = Vec::new();
        for user_id in recipients {
            if user_id == initiator || participants.iter().any(|p| p.user_id == user_id) {
                continue;
            }
            participants.push(CallParticipant {
                user_id,
                status: ParticipantCallStatus::Ringing,
                responded_at: None,
            });
        }
        if participants.is_empty() {
            return Err(DomainError::invalid_argument(
                "recipient_ids",
                "a call needs at least one recipient",
            ));
        }

        Ok(Self {
            id,
            chat_id,
            initiator,
            medium,
            participants,
            status: CallStatus::Initiated,
            created_at,
            started_at: None,
            ended_at: None,
            duration_secs: None,
            version: 0,
        })
    }

    pub fn is_one_to_one(&self) -> bool {
        self.participants.len() == 1
    }

    pub fn is_member(&self, user_id: UserId) -> bool {
        user_id == self.initiator || self.participant(user_id).is_some()
    }

    pub fn participant(&self, user_id: UserId) -> Option<&CallParticipant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    /// 主叫加全部被叫
    pub fn member_ids(&self) -> Vec<UserId> {
        std::iter::once(self.initiator)
            .chain(self.participants.iter().map(|p| p.user_id))
            .collect()
    }

    pub fn start_ringing(&mut self) -> Result<(), DomainError> {
        self.guard(&[CallStatus::Initiated], "start ringing")?;
        self.status = CallStatus::Ringing;
        Ok(())
    }

    /// 被叫无在线会话（Missed）或正忙（Busy）
    pub fn mark_unavailable(
        &mut self,
        user_id: UserId,
        status: ParticipantCallStatus,
        at: Timestamp,
    ) -> Result<(), DomainError> {
        self.guard(&[CallStatus::Ringing], "mark participant unavailable")?;
        let participant = self.participant_mut(user_id)?;
        participant.status = status;
        participant.responded_at = Some(at);
        Ok(())
    }

    /// 接听：振铃中的呼叫，或群呼进行中且该参与者仍在振铃
    pub fn accept(&mut self, user_id: UserId, at: Timestamp) -> Result<(), DomainError> {
        self.guard_ringing_participant(user_id, "accept")?;
        let participant = self.participant_mut(user_id)?;
        participant.status = ParticipantCallStatus::Accepted;
        participant.responded_at = Some(at);
        if self.status == CallStatus::Ringing {
            self.status = CallStatus::Ongoing;
            self.started_at = Some(at);
        }
        Ok(())
    }

    pub fn decline(&mut self, user_id: UserId, at: Timestamp) -> Result<(), DomainError> {
        self.guard_ringing_participant(user_id, "decline")?;
        let participant = self.participant_mut(user_id)?;
        participant.status = ParticipantCallStatus::Declined;
        participant.responded_at = Some(at);
        self.settle_if_unanswered(at);
        Ok(())
    }

    /// 挂断：进行中或振铃中均可
    pub fn end(&mut self, user_id: UserId, at: Timestamp) -> Result<(), DomainError> {
        if !self.is_member(user_id) {
            return Err(DomainError::NotCallParticipant);
        }
        self.guard(&[CallStatus::Ongoing, CallStatus::Ringing], "end")?;
        for participant in self
            .participants
            .iter_mut()
            .filter(|p| p.status == ParticipantCallStatus::Ringing)
        {
            participant.status = ParticipantCallStatus::Missed;
            participant.responded_at = Some(at);
        }
        self.finish(CallStatus::Ended, at);
        Ok(())
    }

    /// 振铃超时：所有仍在振铃的被叫记为未接，整体进入 Missed
    pub fn time_out(&mut self, at: Timestamp) -> Result<(), DomainError> {
        self.guard(&[CallStatus::Ringing], "time out")?;
        for participant in self
            .participants
            .iter_mut()
            .filter(|p| p.status == ParticipantCallStatus::Ringing)
        {
            participant.status = ParticipantCallStatus::Missed;
            participant.responded_at = Some(at);
        }
        self.finish(CallStatus::Missed, at);
        Ok(())
    }

    /// 振铃中且已无人可接听时结束呼叫：有人拒接为 Declined，否则为 Missed。
    /// 返回呼叫是否因此结束
    pub fn settle_if_unanswered(&mut self, at: Timestamp) -> bool {
        if self.status != CallStatus::Ringing {
            return false;
        }
        let pending = self.participants.iter().any(|p| {
            matches!(
                p.status,
                ParticipantCallStatus::Ringing | ParticipantCallStatus::Accepted
            )
        });
        if pending {
            return false;
        }
        let any_declined = self
            .participants
            .iter()
            .any(|p| p.status == ParticipantCallStatus::Declined);
        let outcome = if any_declined {
            CallStatus::Declined
        } else {
            CallStatus::Missed
        };
        self.finish(outcome, at);
        true
    }

    fn finish(&mut self, status: CallStatus, at: Timestamp) {
        self.status = status;
        self.ended_at = Some(at);
        self.duration_secs = self
            .started_at
            .map(|started| (at - started).num_seconds().max(0));
    }

    fn guard(&self, allowed: &[CallStatus], action: &str) -> Result<(), DomainError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DomainError::invalid_call_state(self.status, action))
        }
    }

    fn guard_ringing_participant(&self, user_id: UserId, action: &str) -> Result<(), DomainError> {
        let participant = self.participant(user_id).ok_or(DomainError::NotCallParticipant)?;
        let call_open = match self.status {
            CallStatus::Ringing => true,
            CallStatus::Ongoing => !self.is_one_to_one(),
            _ => false,
        };
        if !call_open || participant.status != ParticipantCallStatus::Ringing {
            return Err(DomainError::invalid_call_state(self.status, action));
        }
        Ok(())
    }

    fn participant_mut(&mut self, user_id: UserId) -> Result<&mut CallParticipant, DomainError> {
        self.participants
            .iter_mut()
            .find(|p| p.user_id == user_id)
            .ok_or(DomainError::NotCallParticipant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    fn ringing_call(caller: UserId, recipients: &[UserId]) -> Call {
        let mut call = Call::new(
            CallId::from(Uuid::new_v4()),
            ChatId::from(Uuid::new_v4()),
            caller,
            recipients.iter().copied(),
            CallMedium::Audio,
            Utc::now(),
        )
        .unwrap();
        call.start_ringing().unwrap();
        call
    }

    #[test]
    fn accept_then_end_sets_duration() {
        let (caller, callee) = (user(), user());
        let mut call = ringing_call(caller, &[callee]);
        let start = Utc::now();

        call.accept(callee, start).unwrap();
        assert_eq!(call.status, CallStatus::Ongoing);

        call.end(caller, start + Duration::seconds(42)).unwrap();
        assert_eq!(call.status, CallStatus::Ended);
        assert_eq!(call.duration_secs, Some(42));
    }

    #[test]
    fn hang_up_before_answer_has_no_duration() {
        let (caller, callee) = (user(), user());
        let mut call = ringing_call(caller, &[callee]);

        call.end(caller, Utc::now()).unwrap();
        assert_eq!(call.status, CallStatus::Ended);
        assert!(call.started_at.is_none());
        assert!(call.duration_secs.is_none());
        assert_eq!(call.participants[0].status, ParticipantCallStatus::Missed);
    }

    #[test]
    fn decline_after_end_is_rejected_without_mutation() {
        let (caller, callee) = (user(), user());
        let mut call = ringing_call(caller, &[callee]);
        let now = Utc::now();
        call.accept(callee, now).unwrap();
        call.end(callee, now + Duration::seconds(5)).unwrap();
        let snapshot = call.clone();

        let err = call.decline(callee, now + Duration::seconds(6)).unwrap_err();
        assert!(matches!(
            err,
            DomainError::InvalidCallState {
                status: CallStatus::Ended,
                ..
            }
        ));
        assert_eq!(call, snapshot);
    }

    #[test]
    fn one_to_one_decline_ends_call() {
        let (caller, callee) = (user(), user());
        let mut call = ringing_call(caller, &[callee]);

        call.decline(callee, Utc::now()).unwrap();
        assert_eq!(call.status, CallStatus::Declined);
        assert!(call.accept(callee, Utc::now()).is_err());
    }

    #[test]
    fn group_call_keeps_ringing_until_everyone_answers() {
        let (caller, a, b) = (user(), user(), user());
        let mut call = ringing_call(caller, &[a, b]);
        let now = Utc::now();

        call.decline(a, now).unwrap();
        assert_eq!(call.status, CallStatus::Ringing);

        call.accept(b, now).unwrap();
        assert_eq!(call.status, CallStatus::Ongoing);
    }

    #[test]
    fn group_call_late_accept_while_ongoing() {
        let (caller, a, b) = (user(), user(), user());
        let mut call = ringing_call(caller, &[a, b]);
        let now = Utc::now();

        call.accept(a, now).unwrap();
        call.accept(b, now + Duration::seconds(3)).unwrap();
        assert_eq!(call.started_at, Some(now));
        assert!(call.accept(b, now).is_err());
    }

    #[test]
    fn unreachable_sole_recipient_settles_as_missed() {
        let (caller, callee) = (user(), user());
        let mut call = ringing_call(caller, &[callee]);
        let now = Utc::now();

        call.mark_unavailable(callee, ParticipantCallStatus::Missed, now)
            .unwrap();
        assert!(call.settle_if_unanswered(now));
        assert_eq!(call.status, CallStatus::Missed);
    }

    #[test]
    fn outsiders_cannot_act_on_call() {
        let (caller, callee) = (user(), user());
        let mut call = ringing_call(caller, &[callee]);

        assert_eq!(
            call.accept(user(), Utc::now()),
            Err(DomainError::NotCallParticipant)
        );
        assert_eq!(
            call.end(user(), Utc::now()),
            Err(DomainError::NotCallParticipant)
        );
    }
}
