use sea_orm::entity::prelude::*;

use crate::types::{MessageStatus, MessageType};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "scheduled_messages")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub uuid: Uuid,
    pub user_id: i64,
    pub message_type: MessageType,
    pub message_body: String,
    pub status: MessageStatus,
    /// Civil `YYYY-MM-DD` in the user's zone at creation time. Part of the
    /// dedup identity; never derived from `scheduled_at`.
    pub scheduled_date: String,
    pub scheduled_at: DateTimeUtc,
    pub sent_at: Option<DateTimeUtc>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub lock_id: Option<Uuid>,
    pub locked_until: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
