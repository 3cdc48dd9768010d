//! REST applier: resolves each mutation to an HTTP route and replays it.
//!
//! Direct table writes go through the `/rest/v1` surface; workflow actions
//! (shifts, stops, travel, field reports) go through `/api/operations`.
//! Ids are pushed as encoded path segments or query values, never spliced
//! into the URL text.

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{ApplyError, RemoteApplier};
use crate::error::{Error, Result};
use crate::model::*;

/// Where and how a mutation is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub method: Method,
    /// Unencoded path segments below the base URL.
    pub segments: Vec<String>,
    /// Row filter, sent as `?id=eq.<id>`.
    pub filter_id: Option<String>,
    pub body: Value,
}

impl Route {
    fn new(method: Method, segments: &[&str], body: Value) -> Self {
        Self {
            method,
            segments: segments.iter().map(|s| s.to_string()).collect(),
            filter_id: None,
            body,
        }
    }

    /// PATCH of the single row `id` in a `/rest/v1` table.
    fn row(table: &str, id: &str, body: Value) -> Self {
        Self {
            filter_id: Some(id.to_string()),
            ..Self::new(Method::PATCH, &["rest", "v1", table], body)
        }
    }

    /// Resolve against `base`. Each segment is percent-encoded on its own,
    /// so ids cannot add segments, a query, or a fragment.
    pub fn url(&self, base: &Url) -> std::result::Result<Url, ApplyError> {
        if let Some(bad) = self
            .segments
            .iter()
            .find(|s| s.is_empty() || *s == "." || *s == "..")
        {
            return Err(ApplyError::permanent(format!("invalid path segment {bad:?}")));
        }

        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| ApplyError::permanent(format!("base url {base} cannot take a path")))?
            .pop_if_empty()
            .extend(&self.segments);
        if let Some(id) = &self.filter_id {
            url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        }
        Ok(url)
    }
}

/// Map a mutation to its HTTP route. Body keys are snake_case.
pub fn resolve_route(mutation: &Mutation) -> Route {
    match mutation {
        Mutation::ChecklistToggle {
            checklist_item_id,
            is_checked,
        } => Route::row(
            "ticket_checklist_items",
            checklist_item_id,
            json!({ "is_checked": is_checked }),
        ),
        Mutation::InspectionScore {
            inspection_item_id,
            score,
            notes,
            photo_taken,
        } => Route::row(
            "inspection_items",
            inspection_item_id,
            json!({ "score": score, "notes": notes, "photo_taken": photo_taken }),
        ),
        Mutation::TimeEvent {
            staff_id,
            ticket_id,
            event_type,
            recorded_at,
            location,
        } => Route::new(
            Method::POST,
            &["rest", "v1", "time_events"],
            json!({
                "staff_id": staff_id,
                "ticket_id": ticket_id,
                "event_type": event_type,
                "recorded_at": recorded_at,
                "lat": location.map(|p| p.lat),
                "lng": location.map(|p| p.lng),
            }),
        ),
        Mutation::PhotoMetadata {
            ticket_id,
            checklist_item_id,
            storage_path,
            caption,
            taken_at,
        } => Route::new(
            Method::POST,
            &["rest", "v1", "ticket_photos"],
            json!({
                "ticket_id": ticket_id,
                "checklist_item_id": checklist_item_id,
                "storage_path": storage_path,
                "caption": caption,
                "taken_at": taken_at,
            }),
        ),
        Mutation::SupplyRequest {
            site_id,
            description,
            priority,
            requested_items,
            requested_date,
        } => Route::new(
            Method::POST,
            &["api", "operations", "field-reports"],
            json!({
                "report_type": "SUPPLY_REQUEST",
                "site_id": site_id,
                "description": description,
                "priority": priority,
                "requested_items": requested_items,
                "requested_date": requested_date,
            }),
        ),
        Mutation::RouteStop { stop_id, action } => {
            let (verb, body) = match action {
                StopAction::Arrive => ("arrive", json!({})),
                StopAction::Complete => ("complete", json!({})),
                StopAction::Skip {
                    skip_reason,
                    skip_notes,
                } => (
                    "skip",
                    json!({ "skip_reason": skip_reason, "skip_notes": skip_notes }),
                ),
            };
            Route::new(
                Method::POST,
                &["api", "operations", "routes", "stops", stop_id.as_str(), verb],
                body,
            )
        }
        Mutation::TravelCapture {
            route_id,
            from_stop_id,
            to_stop_id,
        } => Route::new(
            Method::POST,
            &["api", "operations", "shifts-time", "travel", "capture"],
            json!({
                "route_id": route_id,
                "from_stop_id": from_stop_id,
                "to_stop_id": to_stop_id,
            }),
        ),
        Mutation::TicketStatus {
            ticket_id, status, ..
        } => Route::row("work_tickets", ticket_id, json!({ "status": status })),
        Mutation::InspectionStatus {
            inspection_id,
            status,
            completed_at,
            total_score,
            max_score,
            score_pct,
            passed,
            ..
        } => Route::row(
            "inspections",
            inspection_id,
            json!({
                "status": status,
                "completed_at": completed_at,
                "total_score": total_score,
                "max_score": max_score,
                "score_pct": score_pct,
                "passed": passed,
            }),
        ),
        Mutation::Shift {
            route_id,
            transition,
        } => match transition {
            ShiftTransition::Start {
                mileage_start,
                vehicle_id,
                key_box_number,
            } => Route::new(
                Method::POST,
                &["api", "operations", "routes", route_id.as_str(), "start-shift"],
                json!({
                    "mileage_start": mileage_start,
                    "vehicle_id": vehicle_id,
                    "key_box_number": key_box_number,
                }),
            ),
            ShiftTransition::End {
                mileage_end,
                vehicle_cleaned,
                personal_items_removed,
                floater_notes,
            } => Route::new(
                Method::POST,
                &["api", "operations", "routes", route_id.as_str(), "end-shift"],
                json!({
                    "mileage_end": mileage_end,
                    "vehicle_cleaned": vehicle_cleaned,
                    "personal_items_removed": personal_items_removed,
                    "floater_notes": floater_notes,
                }),
            ),
        },
    }
}

/// Classify a final response status.
pub fn classify_status(status: StatusCode) -> std::result::Result<(), ApplyError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("HTTP {}", status.as_u16());
    let retryable = status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT
                | StatusCode::TOO_MANY_REQUESTS
                | StatusCode::CONFLICT
                | StatusCode::PRECONDITION_FAILED
        );
    if retryable {
        Err(ApplyError::transient(message))
    } else {
        Err(ApplyError::permanent(message))
    }
}

/// Applier talking to the system of record over HTTP.
pub struct HttpApplier {
    client: reqwest::Client,
    base_url: Url,
    token: SecretString,
}

impl HttpApplier {
    pub fn new(base_url: impl AsRef<str>, token: SecretString) -> Result<Self> {
        let raw = base_url.as_ref();
        let base_url = Url::parse(raw)
            .map_err(|e| Error::Config(format!("invalid api url {raw:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("api url {raw:?} cannot take a path")));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("fieldsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    async fn send(
        &self,
        route: &Route,
        url: &Url,
        pending: &PendingMutation,
        last_writer_wins: bool,
    ) -> std::result::Result<StatusCode, ApplyError> {
        let mut request = self
            .client
            .request(route.method.clone(), url.clone())
            .bearer_auth(self.token.expose_secret())
            .header("x-offline-replay", "1")
            .header("x-queued-at", pending.created_at.to_rfc3339())
            .header("idempotency-key", pending.id.0.to_string())
            .json(&route.body);

        if let Some(version) = pending.mutation.version_token() {
            request = request.header("if-match", format!("\"{version}\""));
        }
        if last_writer_wins {
            request = request.header("x-conflict-strategy", "last-writer-wins");
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                ApplyError::permanent(format!("bad request: {e}"))
            } else {
                ApplyError::transient(format!("network error: {e}"))
            }
        })?;
        Ok(response.status())
    }
}

#[async_trait]
impl RemoteApplier for HttpApplier {
    async fn apply(&self, pending: &PendingMutation) -> std::result::Result<(), ApplyError> {
        let route = resolve_route(&pending.mutation);
        let url = route.url(&self.base_url)?;
        debug!(id = %pending.id, method = %route.method, path = url.path(), "replaying mutation");

        let mut status = self.send(&route, &url, pending, false).await?;
        if matches!(
            status,
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED
        ) {
            warn!(id = %pending.id, status = status.as_u16(), "conflict, retrying as last-writer-wins");
            status = self.send(&route, &url, pending, true).await?;
        }
        classify_status(status)
    }
}
