//! Domain records tracked by the gift book.
//!
//! Every record is owned by exactly one user and keeps the same id locally and
//! remotely. Field names serialize camelCase to match the document store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Unknown entity type: {0}")]
pub struct EntityTypeError(String);

/// Collection tag for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Gift,
    Person,
    Return,
    Reminder,
    Image,
}

impl EntityType {
    /// All entity types, in pull order.
    pub const ALL: [EntityType; 5] = [
        EntityType::Person,
        EntityType::Gift,
        EntityType::Return,
        EntityType::Reminder,
        EntityType::Image,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Gift => "gift",
            EntityType::Person => "person",
            EntityType::Return => "return",
            EntityType::Reminder => "reminder",
            EntityType::Image => "image",
        }
    }

    /// Name of the remote collection holding this type.
    pub fn collection(self) -> &'static str {
        match self {
            EntityType::Gift => "gifts",
            EntityType::Person => "persons",
            EntityType::Return => "returns",
            EntityType::Reminder => "reminders",
            EntityType::Image => "images",
        }
    }
}

impl Display for EntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = EntityTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.collection() == s)
            .ok_or_else(|| EntityTypeError(s.to_string()))
    }
}

/// A gift the user received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gift {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Person who gave the gift
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub giver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occasion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub image_ids: Vec<String>,
    /// Whether a reciprocal gift is owed
    #[serde(default)]
    pub needs_return: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Someone who gives or receives gifts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnStatus {
    #[default]
    Planned,
    Purchased,
    Given,
}

/// A reciprocal gift owed for a received one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnGift {
    pub id: String,
    pub user_id: String,
    pub gift_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: ReturnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A dated nudge, usually for an upcoming return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gift_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_id: Option<String>,
    pub remind_at: DateTime<Utc>,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Photo attached to a gift, stored inline as a data URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftImage {
    pub id: String,
    pub user_id: String,
    pub gift_id: String,
    pub mime_type: String,
    pub data: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Any synchronized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", rename_all = "lowercase")]
pub enum Entity {
    Gift(Gift),
    Person(Person),
    Return(ReturnGift),
    Reminder(Reminder),
    Image(GiftImage),
}

macro_rules! with_record {
    ($entity:expr, $r:ident => $body:expr) => {
        match $entity {
            Entity::Gift($r) => $body,
            Entity::Person($r) => $body,
            Entity::Return($r) => $body,
            Entity::Reminder($r) => $body,
            Entity::Image($r) => $body,
        }
    };
}

impl Entity {
    pub fn id(&self) -> &str {
        with_record!(self, r => &r.id)
    }

    pub fn user_id(&self) -> &str {
        with_record!(self, r => &r.user_id)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        with_record!(self, r => r.created_at)
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        with_record!(self, r => r.updated_at)
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Entity::Gift(_) => EntityType::Gift,
            Entity::Person(_) => EntityType::Person,
            Entity::Return(_) => EntityType::Return,
            Entity::Reminder(_) => EntityType::Reminder,
            Entity::Image(_) => EntityType::Image,
        }
    }

    /// Stamp a modification time.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        with_record!(self, r => r.updated_at = now)
    }

    /// Stamp both creation and modification times.
    pub fn stamp_created(&mut self, now: DateTime<Utc>) {
        with_record!(self, r => {
            r.created_at = now;
            r.updated_at = now;
        })
    }
}

impl From<Gift> for Entity {
    fn from(gift: Gift) -> Self {
        Entity::Gift(gift)
    }
}

impl From<Person> for Entity {
    fn from(person: Person) -> Self {
        Entity::Person(person)
    }
}

impl From<ReturnGift> for Entity {
    fn from(ret: ReturnGift) -> Self {
        Entity::Return(ret)
    }
}

impl From<Reminder> for Entity {
    fn from(reminder: Reminder) -> Self {
        Entity::Reminder(reminder)
    }
}

impl From<GiftImage> for Entity {
    fn from(image: GiftImage) -> Self {
        Entity::Image(image)
    }
}
