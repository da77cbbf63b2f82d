//! Per-session conversation memory: recent turns and remembered entities

use crate::types::*;
use crate::vocabulary::find_word;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_MAX_TURNS: usize = 10;
/// Characters of a query or answer kept in a turn summary
pub const SUMMARY_CHARS: usize = 100;

/// What a back-reference in the text points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRef {
    Region,
    Period,
    Floats,
}

const REFERENCE_PHRASES: &[(&str, EntityRef)] = &[
    ("that region", EntityRef::Region),
    ("this region", EntityRef::Region),
    ("same region", EntityRef::Region),
    ("that area", EntityRef::Region),
    ("this area", EntityRef::Region),
    ("same area", EntityRef::Region),
    ("that location", EntityRef::Region),
    ("same location", EntityRef::Region),
    ("same place", EntityRef::Region),
    ("that period", EntityRef::Period),
    ("same period", EntityRef::Period),
    ("that time", EntityRef::Period),
    ("same time", EntityRef::Period),
    ("same dates", EntityRef::Period),
    ("that month", EntityRef::Period),
    ("same month", EntityRef::Period),
    ("that year", EntityRef::Period),
    ("same year", EntityRef::Period),
    ("those floats", EntityRef::Floats),
    ("these floats", EntityRef::Floats),
    ("same floats", EntityRef::Floats),
    ("that float", EntityRef::Floats),
    ("this float", EntityRef::Floats),
    ("same float", EntityRef::Floats),
];

/// Back-reference phrases present in normalized text
pub fn find_references(text: &str) -> Vec<&'static str> {
    REFERENCE_PHRASES
        .iter()
        .filter(|(phrase, _)| find_word(text, phrase).is_some())
        .map(|(phrase, _)| *phrase)
        .collect()
}

pub fn reference_kind(phrase: &str) -> Option<EntityRef> {
    REFERENCE_PHRASES
        .iter()
        .find(|(p, _)| *p == phrase)
        .map(|(_, kind)| *kind)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub id: u64,
    pub query: String,
    pub intent: IntentKind,
    /// Filled once the answer is known; `None` while in flight
    pub summary: Option<String>,
    pub at: DateTime<Utc>,
}

/// Snapshot-able state for one session
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub turns: VecDeque<Turn>,
    pub entities: BTreeMap<String, ParamValue>,
    pub created_at: DateTime<Utc>,
    next_turn: u64,
    last_access: Instant,
}

impl SessionContext {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            turns: VecDeque::new(),
            entities: BTreeMap::new(),
            created_at: Utc::now(),
            next_turn: 0,
            last_access: Instant::now(),
        }
    }

    pub fn entity(&self, key: &str) -> Option<&ParamValue> {
        self.entities.get(key)
    }

    pub fn period(&self) -> Option<DateRange> {
        match (self.entity(keys::PERIOD_START), self.entity(keys::PERIOD_END)) {
            (Some(ParamValue::Date(start)), Some(ParamValue::Date(end))) => Some(DateRange::new(*start, *end)),
            _ => None,
        }
    }

    pub fn last_region(&self) -> Option<&str> {
        match self.entity(keys::REGION) {
            Some(ParamValue::Text(name)) => Some(name),
            _ => None,
        }
    }

    /// Resolve a back-reference phrase ("that region") or an entity key ("region").
    pub fn resolve_reference(&self, token: &str) -> Option<ParamValue> {
        let token = token.trim().to_lowercase();
        if let Some(value) = self.entities.get(&token) {
            return Some(value.clone());
        }
        match reference_kind(&token)? {
            EntityRef::Region => self
                .entity(keys::LOCATION)
                .or_else(|| self.entity(keys::REGION))
                .cloned(),
            EntityRef::Period => self.period().map(|range| {
                ParamValue::List(vec![range.start.to_string(), range.end.to_string()])
            }),
            EntityRef::Floats => self.entity(keys::FLOAT_IDS).cloned(),
        }
    }

    /// Most recent turns, oldest first, as short "question -> answer" lines
    pub fn history(&self, limit: usize) -> Vec<String> {
        let skip = self.turns.len().saturating_sub(limit);
        self.turns
            .iter()
            .skip(skip)
            .map(|t| match &t.summary {
                Some(summary) => format!("Q: {} -> A: {}", truncate_chars(&t.query, SUMMARY_CHARS), summary),
                None => format!("Q: {}", truncate_chars(&t.query, SUMMARY_CHARS)),
            })
            .collect()
    }

    fn remember(&mut self, intent: &ClassifiedIntent) {
        if let Some(sp) = intent.spatial() {
            self.entities.remove(keys::REGION);
            self.entities.insert(
                keys::LOCATION.to_string(),
                ParamValue::Point { lat: sp.lat, lon: sp.lon, radius_km: sp.radius_km },
            );
        } else if let Some(region) = intent.regions().first() {
            self.entities.remove(keys::LOCATION);
            self.entities
                .insert(keys::REGION.to_string(), ParamValue::Text(region.clone()));
        }
        if let Some(range) = intent.date_range() {
            self.entities
                .insert(keys::PERIOD_START.to_string(), ParamValue::Date(range.start));
            self.entities
                .insert(keys::PERIOD_END.to_string(), ParamValue::Date(range.end));
        }
        if let Some(id) = intent.float_id() {
            self.entities
                .insert(keys::FLOAT_IDS.to_string(), ParamValue::List(vec![id.to_string()]));
        }
    }
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// In-process session memory with bounded history and idle eviction.
/// Each session is locked on its own; unrelated sessions never contend.
pub struct SessionStore {
    sessions: DashMap<String, SessionContext>,
    max_turns: usize,
    idle_ttl: Duration,
}

impl SessionStore {
    pub fn new(max_turns: usize, idle_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            max_turns: max_turns.max(1),
            idle_ttl,
        }
    }

    /// Record a turn at submission time so that turns keep submission order
    /// even when answers complete out of order. Returns the turn id.
    pub fn begin_turn(&self, session_id: &str, query: &Query, intent: &ClassifiedIntent) -> u64 {
        let mut ctx = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionContext::new(session_id));

        let id = ctx.next_turn;
        ctx.next_turn += 1;
        ctx.turns.push_back(Turn {
            id,
            query: query.raw_text.clone(),
            intent: intent.kind,
            summary: None,
            at: Utc::now(),
        });
        while ctx.turns.len() > self.max_turns {
            ctx.turns.pop_front();
        }
        ctx.remember(intent);
        ctx.last_access = Instant::now();
        id
    }

    /// Attach the answer summary to a turn. A turn already pushed out of the
    /// window is silently ignored.
    pub fn record_summary(&self, session_id: &str, turn_id: u64, summary: &str) {
        if let Some(mut ctx) = self.sessions.get_mut(session_id) {
            if let Some(turn) = ctx.turns.iter_mut().find(|t| t.id == turn_id) {
                turn.summary = Some(truncate_chars(summary, SUMMARY_CHARS));
            }
            ctx.last_access = Instant::now();
        }
    }

    /// Append a complete turn in one step
    pub fn update(&self, session_id: &str, query: Query, intent: ClassifiedIntent, summary: Option<String>) {
        let id = self.begin_turn(session_id, &query, &intent);
        if let Some(summary) = summary {
            self.record_summary(session_id, id, &summary);
        }
    }

    pub fn resolve_reference(&self, session_id: &str, token: &str) -> Option<ParamValue> {
        self.sessions.get(session_id)?.resolve_reference(token)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionContext> {
        self.sessions.get(session_id).map(|ctx| ctx.clone())
    }

    /// Drop sessions idle longer than the configured TTL
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, ctx| now.duration_since(ctx.last_access) < self.idle_ttl);
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.sessions.len(), "Evicted idle sessions");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
