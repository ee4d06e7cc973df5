use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::duration::GoDuration;

pub type Timestamp = DateTime<Utc>;

/// Identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default = "Ulid::nil")]
    pub uid: Ulid,
    /// Stamped by the store on create unless the incoming object already carries one.
    #[serde(default)]
    pub creation_timestamp: Timestamp,
    /// Bumped on every accepted write; a conditional update must echo the current value.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: Ulid::nil(),
            creation_timestamp: Timestamp::default(),
            resource_version: 0,
        }
    }
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WishSpec {
    pub title: String,
    #[serde(default, rename = "imageURL", skip_serializing_if = "String::is_empty")]
    pub image_url: String,
    #[serde(default, rename = "officialURL", skip_serializing_if = "String::is_empty")]
    pub official_url: String,
    #[serde(default, rename = "purchaseURLs", skip_serializing_if = "Vec::is_empty")]
    pub purchase_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msrp: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// 0–5, displayed as stars.
    #[serde(default)]
    pub priority: i32,
    /// How long the wish stays active after creation. Unset means forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<GoDuration>,
    /// Total units that can be reserved. Zero or negative reads as 1.
    #[serde(default = "default_quantity")]
    pub quantity: i32,
}

impl WishSpec {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            image_url: String::new(),
            official_url: String::new(),
            purchase_urls: Vec::new(),
            msrp: String::new(),
            tags: Vec::new(),
            context_tags: Vec::new(),
            description: String::new(),
            priority: 0,
            ttl: None,
            quantity: default_quantity(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().chain(&self.context_tags).any(|t| t == tag)
    }
}

/// A claim on part of a wish's stock. Never edited after creation; only swept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub quantity: i32,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

impl Reservation {
    /// A reservation of `quantity` units starting at `now` and lasting `weeks` weeks.
    pub fn for_weeks(quantity: i32, now: Timestamp, weeks: u32) -> Self {
        Self {
            quantity,
            created_at: now,
            expires_at: now + TimeDelta::weeks(i64::from(weeks)),
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

/// The single-reservation shape used before wishes could be reserved more than once.
/// Read for migration, never written with `reserved = true` by this service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyReservation {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reserved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_expires: Option<Timestamp>,
}

/// Outcome of inspecting the legacy fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyState {
    /// Nothing to migrate.
    Absent,
    /// A complete legacy record, convertible into exactly one reservation.
    Convertible(Reservation),
    /// Marked reserved but missing a timestamp; cleared without conversion.
    Incomplete,
}

impl LegacyReservation {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn state(&self) -> LegacyState {
        if !self.reserved {
            return LegacyState::Absent;
        }
        match (self.reserved_at, self.reservation_expires) {
            (Some(created_at), Some(expires_at)) => LegacyState::Convertible(Reservation {
                quantity: 1,
                created_at,
                expires_at,
            }),
            _ => LegacyState::Incomplete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

impl From<bool> for ConditionStatus {
    fn from(v: bool) -> Self {
        if v { Self::True } else { Self::False }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WishStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reservations: Vec<Reservation>,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(flatten)]
    pub legacy: LegacyReservation,
}

impl WishStatus {
    pub fn condition(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wish {
    pub metadata: ObjectMeta,
    pub spec: WishSpec,
    #[serde(default)]
    pub status: WishStatus,
}

impl Wish {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: WishSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec,
            status: WishStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }
}

/// Store change record: what the WAL persists and what watchers receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Applied(Wish),
    Deleted { namespace: String, name: String },
}

impl Event {
    pub fn namespace(&self) -> &str {
        match self {
            Event::Applied(wish) => wish.namespace(),
            Event::Deleted { namespace, .. } => namespace,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Event::Applied(wish) => wish.name(),
            Event::Deleted { name, .. } => name,
        }
    }
}
