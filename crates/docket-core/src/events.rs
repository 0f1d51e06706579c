//! Change notifier: pipeline events, envelope schema, and scoped subscriptions.
//!
//! Every committed state transition in the pipeline is published as a
//! [`PipelineEvent`] wrapped in a versioned [`EventEnvelope`]. Subscribers
//! register a [`ScopeFilter`] (project and/or document) and receive only the
//! envelopes that match it.
//!
//! Delivery is best-effort and at-least-once from the subscriber's point of
//! view: a subscriber that falls behind the bounded buffer receives
//! [`SubscriptionItem::Lagged`] and is expected to resynchronize by
//! re-reading current state. On reconnect a client subscribes again and does
//! the same full read.
//!
//! ## Wire Format (SSE)
//!
//! ```text
//! event: document.state_changed
//! id: 42
//! data: {"event_id":"...","sequence":42,"event_type":"document.state_changed",...}
//! ```

use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::defaults::EVENT_PAYLOAD_VERSION;
use crate::models::{DocumentState, FailureReason, IngestOutcome};

// ============================================================================
// Envelope
// ============================================================================

/// Actor metadata for event attribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventActor {
    /// Actor type: `"system"` or `"user"`.
    pub kind: String,
    /// Identity tag from the authorization context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl EventActor {
    /// System actor (workers, internal transitions).
    pub fn system() -> Self {
        Self {
            kind: "system".to_string(),
            id: None,
        }
    }

    /// Authenticated caller.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: "user".to_string(),
            id: Some(id.into()),
        }
    }
}

/// Optional emission context.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    /// Who caused this event. Defaults to the system actor.
    pub actor: Option<EventActor>,
    /// Correlation ID tying together events of one request or job.
    pub correlation_id: Option<Uuid>,
}

impl EventContext {
    pub fn actor(actor: EventActor) -> Self {
        Self {
            actor: Some(actor),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

/// Versioned event envelope.
///
/// `sequence` increases monotonically per notifier in publication order, so
/// a subscriber can detect gaps. `payload_version` increments on breaking
/// payload changes; consumers ignore unknown fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub sequence: u64,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Uuid>,
    pub actor: EventActor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub payload_version: u32,
    pub payload: PipelineEvent,
}

// ============================================================================
// Events
// ============================================================================

/// A committed state change in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    DocumentIngested {
        project_id: Uuid,
        document_id: Uuid,
        locator: String,
        content_hash: String,
        outcome: IngestOutcome,
    },
    DocumentStateChanged {
        project_id: Uuid,
        document_id: Uuid,
        from: DocumentState,
        to: DocumentState,
        version: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure: Option<FailureReason>,
    },
    DocumentCancelRequested {
        project_id: Uuid,
        document_id: Uuid,
    },
    RepresentationSuperseded {
        project_id: Uuid,
        document_id: Uuid,
        representation_id: Uuid,
    },
    BlocksExtracted {
        project_id: Uuid,
        document_id: Uuid,
        representation_id: Uuid,
        block_count: i32,
        fingerprint: String,
    },
    RunStarted {
        project_id: Uuid,
        document_id: Uuid,
        run_id: Uuid,
        schema_id: Uuid,
        schema_version: i32,
        fingerprint: String,
    },
    OverlaysPublished {
        project_id: Uuid,
        document_id: Uuid,
        run_id: Uuid,
        overlay_count: i32,
    },
    RunSucceeded {
        project_id: Uuid,
        document_id: Uuid,
        run_id: Uuid,
        overlay_count: i32,
    },
    RunFailed {
        project_id: Uuid,
        document_id: Uuid,
        run_id: Uuid,
        failure: FailureReason,
    },
    SchemaPublished {
        schema_id: Uuid,
        schema_ref: String,
        version: i32,
    },
}

impl PipelineEvent {
    /// Dot-namespaced event type for the envelope.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DocumentIngested { .. } => "document.ingested",
            Self::DocumentStateChanged { .. } => "document.state_changed",
            Self::DocumentCancelRequested { .. } => "document.cancel_requested",
            Self::RepresentationSuperseded { .. } => "document.representation_superseded",
            Self::BlocksExtracted { .. } => "document.blocks_extracted",
            Self::RunStarted { .. } => "run.started",
            Self::OverlaysPublished { .. } => "overlays.published",
            Self::RunSucceeded { .. } => "run.succeeded",
            Self::RunFailed { .. } => "run.failed",
            Self::SchemaPublished { .. } => "schema.published",
        }
    }

    /// Project scope; `None` for global events.
    pub fn project_id(&self) -> Option<Uuid> {
        match self {
            Self::DocumentIngested { project_id, .. }
            | Self::DocumentStateChanged { project_id, .. }
            | Self::DocumentCancelRequested { project_id, .. }
            | Self::RepresentationSuperseded { project_id, .. }
            | Self::BlocksExtracted { project_id, .. }
            | Self::RunStarted { project_id, .. }
            | Self::OverlaysPublished { project_id, .. }
            | Self::RunSucceeded { project_id, .. }
            | Self::RunFailed { project_id, .. } => Some(*project_id),
            Self::SchemaPublished { .. } => None,
        }
    }

    /// Document scope; `None` for global events.
    pub fn document_id(&self) -> Option<Uuid> {
        match self {
            Self::DocumentIngested { document_id, .. }
            | Self::DocumentStateChanged { document_id, .. }
            | Self::DocumentCancelRequested { document_id, .. }
            | Self::RepresentationSuperseded { document_id, .. }
            | Self::BlocksExtracted { document_id, .. }
            | Self::RunStarted { document_id, .. }
            | Self::OverlaysPublished { document_id, .. }
            | Self::RunSucceeded { document_id, .. }
            | Self::RunFailed { document_id, .. } => Some(*document_id),
            Self::SchemaPublished { .. } => None,
        }
    }
}

// ============================================================================
// Scope filter
// ============================================================================

/// Subscription scope. An empty filter receives everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilter {
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub document_id: Option<Uuid>,
}

impl ScopeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn project(project_id: Uuid) -> Self {
        Self {
            project_id: Some(project_id),
            document_id: None,
        }
    }

    pub fn document(document_id: Uuid) -> Self {
        Self {
            project_id: None,
            document_id: Some(document_id),
        }
    }

    /// Global (unscoped) events only match a filter with no constraints.
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        if let Some(project_id) = self.project_id {
            if envelope.project_id != Some(project_id) {
                return false;
            }
        }
        if let Some(document_id) = self.document_id {
            if envelope.document_id != Some(document_id) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Fan-out hub for pipeline events.
///
/// Backed by a `tokio::sync::broadcast` channel; each subscription owns an
/// independent receiver, so a slow subscriber never blocks publishers or
/// other subscribers.
pub struct ChangeNotifier {
    tx: broadcast::Sender<EventEnvelope>,
    /// Next sequence number; held across `send` so sequence order is delivery order.
    sequence: Mutex<u64>,
}

impl ChangeNotifier {
    /// Create a notifier with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            sequence: Mutex::new(0),
        }
    }

    /// Publish an event attributed to the system actor.
    pub fn publish(&self, event: PipelineEvent) -> EventEnvelope {
        self.publish_with_context(event, EventContext::default())
    }

    /// Publish an event with explicit actor and correlation.
    ///
    /// Events with no matching subscriber are dropped.
    pub fn publish_with_context(&self, event: PipelineEvent, ctx: EventContext) -> EventEnvelope {
        let mut next = self.sequence.lock().unwrap_or_else(|p| p.into_inner());
        *next += 1;
        let envelope = EventEnvelope {
            event_id: crate::uuid_utils::new_v7(),
            sequence: *next,
            event_type: event.event_type().to_string(),
            occurred_at: Utc::now(),
            project_id: event.project_id(),
            document_id: event.document_id(),
            actor: ctx.actor.unwrap_or_else(EventActor::system),
            correlation_id: ctx.correlation_id,
            payload_version: EVENT_PAYLOAD_VERSION,
            payload: event,
        };
        tracing::debug!(
            event_type = %envelope.event_type,
            sequence = envelope.sequence,
            subscriber_count = self.tx.receiver_count(),
            "ChangeNotifier publish"
        );
        let _ = self.tx.send(envelope.clone());
        envelope
    }

    /// Register a scoped subscription. Dropping it unsubscribes.
    pub fn subscribe(&self, filter: ScopeFilter) -> Subscription {
        Subscription {
            filter,
            inner: BroadcastStream::new(self.tx.subscribe()),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Sequence number of the most recently published event.
    pub fn last_sequence(&self) -> u64 {
        *self.sequence.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

/// Item yielded by a [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    Event(EventEnvelope),
    /// The subscriber fell behind and `missed` events were dropped; resync.
    Lagged { missed: u64 },
}

/// Live, scoped stream of pipeline events.
pub struct Subscription {
    filter: ScopeFilter,
    inner: BroadcastStream<EventEnvelope>,
}

impl Subscription {
    pub fn filter(&self) -> ScopeFilter {
        self.filter
    }

    /// Release the registration.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Stream for Subscription {
    type Item = SubscriptionItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(envelope))) => {
                    if this.filter.matches(&envelope) {
                        return Poll::Ready(Some(SubscriptionItem::Event(envelope)));
                    }
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    return Poll::Ready(Some(SubscriptionItem::Lagged { missed }));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
