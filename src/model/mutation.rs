//! Mutation kinds and the persisted queue record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Pending Mutation
// ---------------------------------------------------------------------------

/// A queued mutation as persisted in the sync snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Unique within the queue, assigned at enqueue.
    pub id: MutationId,

    /// What to apply remotely.
    pub mutation: Mutation,

    pub created_at: DateTime<Utc>,

    /// Failed apply attempts so far.
    #[serde(default)]
    pub attempts: u32,

    /// Error text from the most recent failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,

    /// Set once automatic flushes stop retrying this entry. Only the
    /// failure inbox can retry or dismiss a parked mutation.
    #[serde(default)]
    pub parked: bool,
}

impl PendingMutation {
    pub fn new(mutation: Mutation) -> Self {
        Self {
            id: MutationId::new(),
            mutation,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
            parked: false,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.last_error.is_some()
    }
}

/// Newtype for mutation IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId(pub Uuid);

impl MutationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for MutationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

/// A single user-initiated write, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mutation {
    ChecklistToggle {
        checklist_item_id: String,
        is_checked: bool,
    },
    InspectionScore {
        inspection_item_id: String,
        score: i32,
        #[serde(default)]
        notes: Option<String>,
        #[serde(default)]
        photo_taken: bool,
    },
    TimeEvent {
        staff_id: String,
        #[serde(default)]
        ticket_id: Option<String>,
        event_type: TimeEventType,
        recorded_at: DateTime<Utc>,
        #[serde(default)]
        location: Option<GeoPoint>,
    },
    PhotoMetadata {
        ticket_id: String,
        #[serde(default)]
        checklist_item_id: Option<String>,
        storage_path: String,
        #[serde(default)]
        caption: Option<String>,
        taken_at: DateTime<Utc>,
    },
    SupplyRequest {
        #[serde(default)]
        site_id: Option<String>,
        description: String,
        priority: String,
        requested_items: Vec<RequestedItem>,
        #[serde(default)]
        requested_date: Option<String>,
    },
    RouteStop {
        stop_id: String,
        action: StopAction,
    },
    TravelCapture {
        route_id: String,
        from_stop_id: String,
        to_stop_id: String,
    },
    TicketStatus {
        ticket_id: String,
        status: String,
        #[serde(default)]
        client_version: Option<i64>,
    },
    InspectionStatus {
        inspection_id: String,
        status: String,
        client_version: i64,
        #[serde(default)]
        completed_at: Option<DateTime<Utc>>,
        #[serde(default)]
        total_score: Option<i32>,
        #[serde(default)]
        max_score: Option<i32>,
        #[serde(default)]
        score_pct: Option<i32>,
        #[serde(default)]
        passed: Option<bool>,
    },
    Shift {
        route_id: String,
        transition: ShiftTransition,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeEventType {
    CheckIn,
    CheckOut,
    BreakStart,
    BreakEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedItem {
    pub supply_id: String,
    pub qty: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAction {
    Arrive,
    Complete,
    Skip {
        skip_reason: String,
        #[serde(default)]
        skip_notes: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftTransition {
    Start {
        mileage_start: u32,
        vehicle_id: String,
        #[serde(default)]
        key_box_number: Option<String>,
    },
    End {
        mileage_end: u32,
        vehicle_cleaned: bool,
        personal_items_removed: bool,
        #[serde(default)]
        floater_notes: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// How a mutation kind behaves in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationClass {
    /// Overwrites one field; later enqueues on the same key replace it.
    FieldUpdate,
    /// Immutable occurrence; never deduped, replayed in order.
    AppendOnly,
    /// Lifecycle move, possibly guarded by a version token.
    StateTransition,
}

/// Fieldless tag of a [`Mutation`], matching its serde `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationType {
    ChecklistToggle,
    InspectionScore,
    TimeEvent,
    PhotoMetadata,
    SupplyRequest,
    RouteStop,
    TravelCapture,
    TicketStatus,
    InspectionStatus,
    Shift,
}

impl MutationType {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationType::ChecklistToggle => "checklist_toggle",
            MutationType::InspectionScore => "inspection_score",
            MutationType::TimeEvent => "time_event",
            MutationType::PhotoMetadata => "photo_metadata",
            MutationType::SupplyRequest => "supply_request",
            MutationType::RouteStop => "route_stop",
            MutationType::TravelCapture => "travel_capture",
            MutationType::TicketStatus => "ticket_status",
            MutationType::InspectionStatus => "inspection_status",
            MutationType::Shift => "shift",
        }
    }
}

impl std::fmt::Display for MutationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MutationType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| crate::error::Error::Other(format!("unknown mutation type: {s}")))
    }
}

/// Remote entity a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    ChecklistItem,
    InspectionItem,
    Staff,
    Ticket,
    Site,
    RouteStop,
    Route,
    Inspection,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

/// (entity, field) pair collapsing repeated field updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub entity: EntityRef,
    pub field: &'static str,
}

/// Entity id used for supply requests not tied to a site.
pub const UNASSIGNED_SITE: &str = "unassigned";

impl Mutation {
    pub fn mutation_type(&self) -> MutationType {
        match self {
            Mutation::ChecklistToggle { .. } => MutationType::ChecklistToggle,
            Mutation::InspectionScore { .. } => MutationType::InspectionScore,
            Mutation::TimeEvent { .. } => MutationType::TimeEvent,
            Mutation::PhotoMetadata { .. } => MutationType::PhotoMetadata,
            Mutation::SupplyRequest { .. } => MutationType::SupplyRequest,
            Mutation::RouteStop { .. } => MutationType::RouteStop,
            Mutation::TravelCapture { .. } => MutationType::TravelCapture,
            Mutation::TicketStatus { .. } => MutationType::TicketStatus,
            Mutation::InspectionStatus { .. } => MutationType::InspectionStatus,
            Mutation::Shift { .. } => MutationType::Shift,
        }
    }

    pub fn class(&self) -> MutationClass {
        match self {
            Mutation::ChecklistToggle { .. } | Mutation::InspectionScore { .. } => {
                MutationClass::FieldUpdate
            }
            Mutation::TimeEvent { .. }
            | Mutation::PhotoMetadata { .. }
            | Mutation::SupplyRequest { .. }
            | Mutation::RouteStop { .. }
            | Mutation::TravelCapture { .. } => MutationClass::AppendOnly,
            Mutation::TicketStatus { .. }
            | Mutation::InspectionStatus { .. }
            | Mutation::Shift { .. } => MutationClass::StateTransition,
        }
    }

    pub fn entity(&self) -> EntityRef {
        let (kind, id) = match self {
            Mutation::ChecklistToggle {
                checklist_item_id, ..
            } => (EntityKind::ChecklistItem, checklist_item_id.as_str()),
            Mutation::InspectionScore {
                inspection_item_id, ..
            } => (EntityKind::InspectionItem, inspection_item_id.as_str()),
            Mutation::TimeEvent { staff_id, .. } => (EntityKind::Staff, staff_id.as_str()),
            Mutation::PhotoMetadata { ticket_id, .. } => (EntityKind::Ticket, ticket_id.as_str()),
            Mutation::SupplyRequest { site_id, .. } => (
                EntityKind::Site,
                site_id.as_deref().unwrap_or(UNASSIGNED_SITE),
            ),
            Mutation::RouteStop { stop_id, .. } => (EntityKind::RouteStop, stop_id.as_str()),
            Mutation::TravelCapture { route_id, .. } => (EntityKind::Route, route_id.as_str()),
            Mutation::TicketStatus { ticket_id, .. } => (EntityKind::Ticket, ticket_id.as_str()),
            Mutation::InspectionStatus { inspection_id, .. } => {
                (EntityKind::Inspection, inspection_id.as_str())
            }
            Mutation::Shift { route_id, .. } => (EntityKind::Route, route_id.as_str()),
        };
        EntityRef {
            kind,
            id: id.to_string(),
        }
    }

    /// Dedup key for field updates; `None` for every other class.
    pub fn dedup_key(&self) -> Option<DedupKey> {
        let field = match self {
            Mutation::ChecklistToggle { .. } => "is_checked",
            Mutation::InspectionScore { .. } => "score",
            Mutation::TimeEvent { .. }
            | Mutation::PhotoMetadata { .. }
            | Mutation::SupplyRequest { .. }
            | Mutation::RouteStop { .. }
            | Mutation::TravelCapture { .. }
            | Mutation::TicketStatus { .. }
            | Mutation::InspectionStatus { .. }
            | Mutation::Shift { .. } => return None,
        };
        Some(DedupKey {
            entity: self.entity(),
            field,
        })
    }

    /// Precondition token carried by state transitions, if any.
    pub fn version_token(&self) -> Option<i64> {
        match self {
            Mutation::TicketStatus { client_version, .. } => *client_version,
            Mutation::InspectionStatus { client_version, .. } => Some(*client_version),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(item: &str, score: i32) -> Mutation {
        Mutation::InspectionScore {
            inspection_item_id: item.to_string(),
            score,
            notes: None,
            photo_taken: false,
        }
    }

    #[test]
    fn field_updates_share_dedup_key_per_entity() {
        assert_eq!(score("i-1", 3).dedup_key(), score("i-1", 5).dedup_key());
        assert_ne!(score("i-1", 3).dedup_key(), score("i-2", 3).dedup_key());
    }

    #[test]
    fn only_field_updates_have_dedup_keys() {
        let stop = Mutation::RouteStop {
            stop_id: "s-1".to_string(),
            action: StopAction::Arrive,
        };
        assert_eq!(stop.class(), MutationClass::AppendOnly);
        assert!(stop.dedup_key().is_none());

        let status = Mutation::TicketStatus {
            ticket_id: "t-1".to_string(),
            status: "IN_PROGRESS".to_string(),
            client_version: Some(4),
        };
        assert_eq!(status.class(), MutationClass::StateTransition);
        assert!(status.dedup_key().is_none());
        assert_eq!(status.version_token(), Some(4));
    }

    #[test]
    fn serde_tag_matches_mutation_type() {
        let value = serde_json::to_value(score("i-1", 4)).unwrap();
        assert_eq!(value["type"], "inspection_score");
        assert_eq!(
            "inspection_score".parse::<MutationType>().unwrap(),
            MutationType::InspectionScore
        );
        assert!("nope".parse::<MutationType>().is_err());
    }

    #[test]
    fn supply_request_without_site_targets_unassigned() {
        let request = Mutation::SupplyRequest {
            site_id: None,
            description: "Restock".to_string(),
            priority: "HIGH".to_string(),
            requested_items: vec![RequestedItem {
                supply_id: "sup-1".to_string(),
                qty: 2,
            }],
            requested_date: None,
        };
        assert_eq!(request.entity().id, UNASSIGNED_SITE);
    }

    #[test]
    fn older_records_without_attempts_still_parse() {
        let raw = r#"{
            "id": "6f1c0c52-8a43-4c8e-9d55-2b2f7d0c1a11",
            "mutation": {"type": "checklist_toggle", "checklist_item_id": "c-1", "is_checked": true},
            "created_at": "2024-05-01T12:00:00Z"
        }"#;
        let pending: PendingMutation = serde_json::from_str(raw).unwrap();
        assert_eq!(pending.attempts, 0);
        assert!(!pending.parked);
        assert!(!pending.is_failed());
    }
}
