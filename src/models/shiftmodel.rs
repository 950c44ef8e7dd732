use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    models::{escrowmodel::EscrowCommand, usermodel::Actor},
    service::error::ServiceError,
};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "shift_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ShiftStatus {
    Open,
    Filled,
    Completed,
    Cancelled,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "application_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Accepted,
    Rejected,
    Withdrawn,
    CheckedIn,
    CheckedOut,
    Completed,
    Disputed,
}

impl ApplicationStatus {
    pub fn to_str(&self) -> &str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Accepted => "accepted",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Withdrawn => "withdrawn",
            ApplicationStatus::CheckedIn => "checked_in",
            ApplicationStatus::CheckedOut => "checked_out",
            ApplicationStatus::Completed => "completed",
            ApplicationStatus::Disputed => "disputed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplicationStatus::Rejected | ApplicationStatus::Withdrawn | ApplicationStatus::Completed
        )
    }

    /// The full application transition table.
    pub fn can_transition_to(&self, next: ApplicationStatus) -> bool {
        use ApplicationStatus::*;
        matches!(
            (self, next),
            (Pending, Accepted)
                | (Pending, Rejected)
                | (Pending, Withdrawn)
                | (Accepted, Withdrawn)
                | (Accepted, CheckedIn)
                | (CheckedIn, CheckedOut)
                | (CheckedOut, Completed)
                | (Accepted, Disputed)
                | (CheckedIn, Disputed)
                | (CheckedOut, Disputed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Shift {
    pub id: Uuid,
    pub facility_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: ShiftStatus,
    pub updated_at: DateTime<Utc>,
}

impl Shift {
    fn with_status(&self, status: ShiftStatus, now: DateTime<Utc>) -> Shift {
        Shift {
            status,
            updated_at: now,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct ShiftApplication {
    pub id: Uuid,
    pub shift_id: Uuid,
    pub professional_id: Uuid,
    pub status: ApplicationStatus,
    pub applied_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub checked_out_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Written by the facility about the professional.
    pub rating_for_professional: Option<i16>,
    pub review_for_professional: Option<String>,
    /// Written by the professional about the facility.
    pub rating_for_facility: Option<i16>,
    pub review_for_facility: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ApplicationChange {
    Accept { facility_id: Uuid },
    Reject { facility_id: Uuid },
    Withdraw { professional_id: Uuid, window: Duration },
    CheckIn { professional_id: Uuid },
    CheckOut { professional_id: Uuid },
    ConfirmCompletion { actor: Actor },
    FileDispute { actor: Actor, reason: String },
    AutoComplete { grace: Duration },
    Review { actor: Actor, rating: i16, text: Option<String> },
}

impl ApplicationChange {
    pub fn action(&self) -> &'static str {
        match self {
            ApplicationChange::Accept { .. } => "accept",
            ApplicationChange::Reject { .. } => "reject",
            ApplicationChange::Withdraw { .. } => "withdraw",
            ApplicationChange::CheckIn { .. } => "check in",
            ApplicationChange::CheckOut { .. } => "check out",
            ApplicationChange::ConfirmCompletion { .. } => "confirm completion",
            ApplicationChange::FileDispute { .. } => "file dispute",
            ApplicationChange::AutoComplete { .. } => "auto-complete",
            ApplicationChange::Review { .. } => "review",
        }
    }
}

/// Result of applying a change: the new application row and, when the
/// change flips the parent shift, the new shift row.
#[derive(Debug, Clone)]
pub struct ApplicationUpdate {
    pub application: ShiftApplication,
    pub shift: Option<Shift>,
    /// Set when an accepted application was withdrawn and its payment must be unwound.
    pub unwind_payment: bool,
    /// Dispute to open on the escrow, if one holds funds, in the same write.
    pub escrow_dispute: Option<EscrowCommand>,
}

impl ShiftApplication {
    pub fn new(shift: &Shift, professional_id: Uuid, now: DateTime<Utc>) -> Result<Self, ServiceError> {
        match shift.status {
            ShiftStatus::Open => {}
            ShiftStatus::Filled => return Err(ServiceError::ShiftAlreadyFilled(shift.id)),
            other => return Err(ServiceError::ShiftNotOpen(shift.id, other)),
        }
        if shift.facility_id == professional_id {
            return Err(ServiceError::Validation("facility cannot apply to its own shift".to_string()));
        }

        Ok(ShiftApplication {
            id: Uuid::new_v4(),
            shift_id: shift.id,
            professional_id,
            status: ApplicationStatus::Pending,
            applied_at: now,
            decided_at: None,
            checked_in_at: None,
            checked_out_at: None,
            completed_at: None,
            rating_for_professional: None,
            review_for_professional: None,
            rating_for_facility: None,
            review_for_facility: None,
            updated_at: now,
        })
    }

    fn moved_to(
        &self,
        next: ApplicationStatus,
        action: &'static str,
        now: DateTime<Utc>,
    ) -> Result<ShiftApplication, ServiceError> {
        if !self.status.can_transition_to(next) {
            return Err(ServiceError::InvalidState {
                id: self.id,
                current: self.status,
                action,
            });
        }
        Ok(ShiftApplication {
            status: next,
            updated_at: now,
            ..self.clone()
        })
    }

    fn require_professional(&self, professional_id: Uuid) -> Result<(), ServiceError> {
        if self.professional_id != professional_id {
            return Err(ServiceError::NotOwner(professional_id));
        }
        Ok(())
    }

    fn require_facility(shift: &Shift, facility_id: Uuid) -> Result<(), ServiceError> {
        if shift.facility_id != facility_id {
            return Err(ServiceError::NotOwner(facility_id));
        }
        Ok(())
    }

    /// Checks a change against ownership, the transition table and the
    /// shift's own state, returning the rows to persist.
    pub fn apply_change(
        &self,
        shift: &Shift,
        change: &ApplicationChange,
        now: DateTime<Utc>,
    ) -> Result<ApplicationUpdate, ServiceError> {
        let action = change.action();
        let unchanged_shift = |application: ShiftApplication| ApplicationUpdate {
            application,
            shift: None,
            unwind_payment: false,
            escrow_dispute: None,
        };

        match change {
            ApplicationChange::Accept { facility_id } => {
                Self::require_facility(shift, *facility_id)?;
                if self.status != ApplicationStatus::Pending {
                    return Err(ServiceError::InvalidState { id: self.id, current: self.status, action });
                }
                match shift.status {
                    ShiftStatus::Open => {}
                    ShiftStatus::Filled => return Err(ServiceError::ShiftAlreadyFilled(shift.id)),
                    other => return Err(ServiceError::ShiftNotOpen(shift.id, other)),
                }
                let mut application = self.moved_to(ApplicationStatus::Accepted, action, now)?;
                application.decided_at = Some(now);
                Ok(ApplicationUpdate {
                    application,
                    shift: Some(shift.with_status(ShiftStatus::Filled, now)),
                    unwind_payment: false,
                    escrow_dispute: None,
                })
            }
            ApplicationChange::Reject { facility_id } => {
                Self::require_facility(shift, *facility_id)?;
                let mut application = self.moved_to(ApplicationStatus::Rejected, action, now)?;
                application.decided_at = Some(now);
                Ok(unchanged_shift(application))
            }
            ApplicationChange::Withdraw { professional_id, window } => {
                self.require_professional(*professional_id)?;
                let was_accepted = self.status == ApplicationStatus::Accepted;
                let application = self.moved_to(ApplicationStatus::Withdrawn, action, now)?;
                if !was_accepted {
                    return Ok(unchanged_shift(application));
                }
                if shift.starts_at - now <= *window {
                    return Err(ServiceError::WithdrawalWindowClosed(self.id));
                }
                let reopened = (shift.status == ShiftStatus::Filled)
                    .then(|| shift.with_status(ShiftStatus::Open, now));
                Ok(ApplicationUpdate {
                    application,
                    shift: reopened,
                    unwind_payment: true,
                    escrow_dispute: None,
                })
            }
            ApplicationChange::CheckIn { professional_id } => {
                self.require_professional(*professional_id)?;
                let mut application = self.moved_to(ApplicationStatus::CheckedIn, action, now)?;
                application.checked_in_at = Some(now);
                Ok(unchanged_shift(application))
            }
            ApplicationChange::CheckOut { professional_id } => {
                self.require_professional(*professional_id)?;
                let mut application = self.moved_to(ApplicationStatus::CheckedOut, action, now)?;
                application.checked_out_at = Some(now);
                Ok(unchanged_shift(application))
            }
            ApplicationChange::ConfirmCompletion { actor } => {
                if !actor.is_admin() && !actor.is_user(shift.facility_id) {
                    return Err(ServiceError::NotOwner(actor.user_id().unwrap_or_default()));
                }
                self.complete(shift, action, now)
            }
            ApplicationChange::AutoComplete { grace } => {
                let due = self
                    .checked_out_at
                    .map(|checked_out| checked_out + *grace <= now)
                    .unwrap_or(false);
                if !due {
                    return Err(ServiceError::InvalidState { id: self.id, current: self.status, action });
                }
                self.complete(shift, action, now)
            }
            ApplicationChange::FileDispute { actor, reason } => {
                if !actor.is_user(self.professional_id) && !actor.is_user(shift.facility_id) {
                    return Err(ServiceError::NotOwner(actor.user_id().unwrap_or_default()));
                }
                let reason = reason.trim();
                if reason.is_empty() {
                    return Err(ServiceError::Validation("dispute reason is required".to_string()));
                }
                Ok(ApplicationUpdate {
                    application: self.moved_to(ApplicationStatus::Disputed, action, now)?,
                    shift: None,
                    unwind_payment: false,
                    escrow_dispute: Some(EscrowCommand::FileDispute {
                        actor: *actor,
                        reason: reason.to_string(),
                    }),
                })
            }
            ApplicationChange::Review { actor, rating, text } => {
                if !(1..=5).contains(rating) {
                    return Err(ServiceError::Validation("rating must be between 1 and 5".to_string()));
                }
                if self.status != ApplicationStatus::Completed {
                    return Err(ServiceError::InvalidState { id: self.id, current: self.status, action });
                }
                let mut application = ShiftApplication {
                    updated_at: now,
                    ..self.clone()
                };
                if actor.is_user(shift.facility_id) {
                    if self.rating_for_professional.is_some() {
                        return Err(ServiceError::ReviewAlreadySubmitted(self.id));
                    }
                    application.rating_for_professional = Some(*rating);
                    application.review_for_professional = text.clone();
                } else if actor.is_user(self.professional_id) {
                    if self.rating_for_facility.is_some() {
                        return Err(ServiceError::ReviewAlreadySubmitted(self.id));
                    }
                    application.rating_for_facility = Some(*rating);
                    application.review_for_facility = text.clone();
                } else {
                    return Err(ServiceError::NotOwner(actor.user_id().unwrap_or_default()));
                }
                Ok(unchanged_shift(application))
            }
        }
    }

    fn complete(
        &self,
        shift: &Shift,
        action: &'static str,
        now: DateTime<Utc>,
    ) -> Result<ApplicationUpdate, ServiceError> {
        let mut application = self.moved_to(ApplicationStatus::Completed, action, now)?;
        application.completed_at = Some(now);
        Ok(ApplicationUpdate {
            application,
            shift: Some(shift.with_status(ShiftStatus::Completed, now)),
            unwind_payment: false,
            escrow_dispute: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shift(facility_id: Uuid, starts_in_hours: i64, now: DateTime<Utc>) -> Shift {
        Shift {
            id: Uuid::new_v4(),
            facility_id,
            starts_at: now + Duration::hours(starts_in_hours),
            ends_at: now + Duration::hours(starts_in_hours + 8),
            status: ShiftStatus::Open,
            updated_at: now,
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        use ApplicationStatus::*;
        let all = [Pending, Accepted, Rejected, Withdrawn, CheckedIn, CheckedOut, Completed, Disputed];
        for from in [Rejected, Withdrawn, Completed] {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition_to(to), "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn test_accept_flips_shift_to_filled() {
        let now = Utc::now();
        let facility = Uuid::new_v4();
        let shift = shift(facility, 48, now);
        let app = ShiftApplication::new(&shift, Uuid::new_v4(), now).unwrap();

        let update = app
            .apply_change(&shift, &ApplicationChange::Accept { facility_id: facility }, now)
            .unwrap();
        assert_eq!(update.application.status, ApplicationStatus::Accepted);
        assert_eq!(update.shift.unwrap().status, ShiftStatus::Filled);
    }

    #[test]
    fn test_accept_checks_owner_state_and_shift() {
        let now = Utc::now();
        let facility = Uuid::new_v4();
        let mut shift = shift(facility, 48, now);
        let app = ShiftApplication::new(&shift, Uuid::new_v4(), now).unwrap();

        let err = app
            .apply_change(&shift, &ApplicationChange::Accept { facility_id: Uuid::new_v4() }, now)
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotOwner(_)));

        shift.status = ShiftStatus::Filled;
        let err = app
            .apply_change(&shift, &ApplicationChange::Accept { facility_id: facility }, now)
            .unwrap_err();
        assert!(matches!(err, ServiceError::ShiftAlreadyFilled(_)));

        let rejected = ShiftApplication { status: ApplicationStatus::Rejected, ..app };
        let err = rejected
            .apply_change(&shift, &ApplicationChange::Accept { facility_id: facility }, now)
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState { .. }));
    }

    #[test]
    fn test_apply_to_filled_shift_fails() {
        let now = Utc::now();
        let mut shift = shift(Uuid::new_v4(), 48, now);
        shift.status = ShiftStatus::Filled;
        let err = ShiftApplication::new(&shift, Uuid::new_v4(), now).unwrap_err();
        assert!(matches!(err, ServiceError::ShiftAlreadyFilled(_)));

        shift.status = ShiftStatus::Cancelled;
        let err = ShiftApplication::new(&shift, Uuid::new_v4(), now).unwrap_err();
        assert!(matches!(err, ServiceError::ShiftNotOpen(_, ShiftStatus::Cancelled)));
    }

    #[test]
    fn test_withdraw_after_acceptance_respects_window() {
        let now = Utc::now();
        let facility = Uuid::new_v4();
        let professional = Uuid::new_v4();
        let window = Duration::hours(24);

        let near = shift(facility, 12, now);
        let app = ShiftApplication::new(&near, professional, now).unwrap();
        let accepted = app
            .apply_change(&near, &ApplicationChange::Accept { facility_id: facility }, now)
            .unwrap();
        let filled = accepted.shift.unwrap();
        let err = accepted
            .application
            .apply_change(&filled, &ApplicationChange::Withdraw { professional_id: professional, window }, now)
            .unwrap_err();
        assert!(matches!(err, ServiceError::WithdrawalWindowClosed(_)));

        let far = Shift { starts_at: now + Duration::hours(72), ..filled };
        let update = accepted
            .application
            .apply_change(&far, &ApplicationChange::Withdraw { professional_id: professional, window }, now)
            .unwrap();
        assert_eq!(update.application.status, ApplicationStatus::Withdrawn);
        assert_eq!(update.shift.unwrap().status, ShiftStatus::Open);
        assert!(update.unwind_payment);
    }

    #[test]
    fn test_pending_withdrawal_ignores_window() {
        let now = Utc::now();
        let professional = Uuid::new_v4();
        let shift = shift(Uuid::new_v4(), 1, now);
        let app = ShiftApplication::new(&shift, professional, now).unwrap();
        let update = app
            .apply_change(
                &shift,
                &ApplicationChange::Withdraw { professional_id: professional, window: Duration::hours(24) },
                now,
            )
            .unwrap();
        assert_eq!(update.application.status, ApplicationStatus::Withdrawn);
        assert!(update.shift.is_none());
        assert!(!update.unwind_payment);
    }

    #[test]
    fn test_full_shift_lifecycle_and_reviews() {
        let now = Utc::now();
        let facility = Uuid::new_v4();
        let professional = Uuid::new_v4();
        let shift = shift(facility, 48, now);
        let app = ShiftApplication::new(&shift, professional, now).unwrap();

        let accepted = app
            .apply_change(&shift, &ApplicationChange::Accept { facility_id: facility }, now)
            .unwrap();
        let shift = accepted.shift.unwrap();
        let checked_in = accepted
            .application
            .apply_change(&shift, &ApplicationChange::CheckIn { professional_id: professional }, now)
            .unwrap()
            .application;
        assert!(checked_in.checked_in_at.is_some());
        let checked_out = checked_in
            .apply_change(&shift, &ApplicationChange::CheckOut { professional_id: professional }, now)
            .unwrap()
            .application;

        let err = checked_out
            .apply_change(
                &shift,
                &ApplicationChange::ConfirmCompletion { actor: Actor::professional(professional) },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotOwner(_)));

        let completed = checked_out
            .apply_change(&shift, &ApplicationChange::ConfirmCompletion { actor: Actor::facility(facility) }, now)
            .unwrap();
        assert_eq!(completed.shift.as_ref().unwrap().status, ShiftStatus::Completed);
        let completed = completed.application;

        let reviewed = completed
            .apply_change(
                &shift,
                &ApplicationChange::Review {
                    actor: Actor::facility(facility),
                    rating: 5,
                    text: Some("Great shift".to_string()),
                },
                now,
            )
            .unwrap()
            .application;
        assert_eq!(reviewed.rating_for_professional, Some(5));

        let err = reviewed
            .apply_change(
                &shift,
                &ApplicationChange::Review { actor: Actor::facility(facility), rating: 4, text: None },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::ReviewAlreadySubmitted(_)));
    }

    #[test]
    fn test_auto_complete_waits_for_grace_period() {
        let now = Utc::now();
        let facility = Uuid::new_v4();
        let shift = shift(facility, 48, now);
        let app = ShiftApplication {
            status: ApplicationStatus::CheckedOut,
            checked_out_at: Some(now - Duration::hours(10)),
            ..ShiftApplication::new(&shift, Uuid::new_v4(), now).unwrap()
        };

        let err = app
            .apply_change(&shift, &ApplicationChange::AutoComplete { grace: Duration::hours(48) }, now)
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState { .. }));

        let update = app
            .apply_change(&shift, &ApplicationChange::AutoComplete { grace: Duration::hours(8) }, now)
            .unwrap();
        assert_eq!(update.application.status, ApplicationStatus::Completed);
    }

    #[test]
    fn test_dispute_only_by_parties_from_engaged_states() {
        let now = Utc::now();
        let facility = Uuid::new_v4();
        let professional = Uuid::new_v4();
        let shift = shift(facility, 48, now);
        let pending = ShiftApplication::new(&shift, professional, now).unwrap();

        let dispute = |actor: Actor, reason: &str| ApplicationChange::FileDispute {
            actor,
            reason: reason.to_string(),
        };

        let err = pending
            .apply_change(&shift, &dispute(Actor::facility(facility), "late"), now)
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState { .. }));

        let accepted = ShiftApplication { status: ApplicationStatus::Accepted, ..pending };
        let err = accepted
            .apply_change(&shift, &dispute(Actor::facility(Uuid::new_v4()), "late"), now)
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotOwner(_)));

        let disputed = accepted
            .apply_change(&shift, &dispute(Actor::professional(professional), "  unpaid break  "), now)
            .unwrap();
        assert_eq!(disputed.application.status, ApplicationStatus::Disputed);
        match disputed.escrow_dispute {
            Some(EscrowCommand::FileDispute { reason, .. }) => assert_eq!(reason, "unpaid break"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_blank_dispute_reason_leaves_application_untouched() {
        let now = Utc::now();
        let facility = Uuid::new_v4();
        let shift = shift(facility, 48, now);
        let accepted = ShiftApplication {
            status: ApplicationStatus::Accepted,
            ..ShiftApplication::new(&shift, Uuid::new_v4(), now).unwrap()
        };

        let err = accepted
            .apply_change(
                &shift,
                &ApplicationChange::FileDispute { actor: Actor::facility(facility), reason: " \t ".to_string() },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}
