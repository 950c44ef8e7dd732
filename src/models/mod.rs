pub mod usermodel;
pub mod shiftmodel;
pub mod paymentmodel;
pub mod escrowmodel;
pub mod methodmodel;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::usermodel::Actor;

/// One line of an append-only audit trail.
pub fn audit_line(now: DateTime<Utc>, actor: &Actor, message: &str) -> String {
    format!(
        "[{}] {}: {}\n",
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
        actor.label(),
        message
    )
}
