use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::entities::user;

#[derive(Debug, Error)]
pub enum UserError {
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error("User not found")]
    NotFound,
    #[error("A user with this email already exists")]
    DuplicateEmail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub birthday: String,
    pub timezone: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUser {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub birthday: String,
    pub timezone: String,
    pub active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUser {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub birthday: Option<String>,
    pub timezone: Option<String>,
    pub active: Option<bool>,
}

impl User {
    fn from_model(model: user::Model) -> Self {
        Self {
            id: model.uuid,
            first_name: model.first_name,
            last_name: model.last_name,
            email: model.email,
            birthday: model.birthday,
            timezone: model.timezone,
            active: model.active,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }

    pub async fn create<C: ConnectionTrait>(
        db: &C,
        data: &CreateUser,
        uuid: Uuid,
    ) -> Result<Self, UserError> {
        let now = Utc::now();
        let active = user::ActiveModel {
            uuid: Set(uuid),
            first_name: Set(data.first_name.clone()),
            last_name: Set(data.last_name.clone()),
            email: Set(data.email.clone()),
            birthday: Set(data.birthday.clone()),
            timezone: Set(data.timezone.clone()),
            active: Set(data.active.unwrap_or(true)),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        match active.insert(db).await {
            Ok(model) => Ok(Self::from_model(model)),
            Err(err) if is_unique_violation(&err) => Err(UserError::DuplicateEmail),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn find_all<C: ConnectionTrait>(db: &C) -> Result<Vec<Self>, DbErr> {
        let records = user::Entity::find()
            .order_by_desc(user::Column::CreatedAt)
            .all(db)
            .await?;
        Ok(records.into_iter().map(Self::from_model).collect())
    }

    /// All users the materialiser should consider.
    pub async fn find_active<C: ConnectionTrait>(db: &C) -> Result<Vec<Self>, DbErr> {
        let records = user::Entity::find()
            .filter(user::Column::Active.eq(true))
            .order_by_asc(user::Column::Id)
            .all(db)
            .await?;
        Ok(records.into_iter().map(Self::from_model).collect())
    }

    pub async fn find_by_uuid<C: ConnectionTrait>(
        db: &C,
        uuid: Uuid,
    ) -> Result<Option<Self>, DbErr> {
        let record = user::Entity::find()
            .filter(user::Column::Uuid.eq(uuid))
            .one(db)
            .await?;
        Ok(record.map(Self::from_model))
    }

    pub async fn update<C: ConnectionTrait>(
        db: &C,
        uuid: Uuid,
        data: &UpdateUser,
    ) -> Result<Self, UserError> {
        let record = user::Entity::find()
            .filter(user::Column::Uuid.eq(uuid))
            .one(db)
            .await?
            .ok_or(UserError::NotFound)?;

        let mut active: user::ActiveModel = record.into();
        if let Some(first_name) = &data.first_name {
            active.first_name = Set(first_name.clone());
        }
        if let Some(last_name) = &data.last_name {
            active.last_name = Set(last_name.clone());
        }
        if let Some(email) = &data.email {
            active.email = Set(email.clone());
        }
        if let Some(birthday) = &data.birthday {
            active.birthday = Set(birthday.clone());
        }
        if let Some(timezone) = &data.timezone {
            active.timezone = Set(timezone.clone());
        }
        if let Some(is_active) = data.active {
            active.active = Set(is_active);
        }
        active.updated_at = Set(Utc::now());

        match active.update(db).await {
            Ok(model) => Ok(Self::from_model(model)),
            Err(err) if is_unique_violation(&err) => Err(UserError::DuplicateEmail),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a user; scheduled messages go with it via the cascade.
    pub async fn delete<C: ConnectionTrait>(db: &C, uuid: Uuid) -> Result<(), UserError> {
        let result = user::Entity::delete_many()
            .filter(user::Column::Uuid.eq(uuid))
            .exec(db)
            .await?;
        if result.rows_affected == 0 {
            return Err(UserError::NotFound);
        }
        Ok(())
    }
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(
        err.sql_err(),
        Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
    )
}

#[cfg(test)]
mod tests {
    use sea_orm::Database;
    use sea_orm_migration::MigratorTrait;

    use super::*;

    async fn setup_db() -> sea_orm::DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db_migration::Migrator::up(&db, None).await.unwrap();
        db
    }

    fn sample_user() -> CreateUser {
        CreateUser {
            first_name: "John".to_string(),
            last_name: "Doe".to_string(),
            email: "john.doe@example.com".to_string(),
            birthday: "1990-05-15".to_string(),
            timezone: "America/New_York".to_string(),
            active: None,
        }
    }

    #[tokio::test]
    async fn create_and_find_roundtrip() {
        let db = setup_db().await;
        let user_id = Uuid::new_v4();
        let user = User::create(&db, &sample_user(), user_id).await.unwrap();
        assert_eq!(user.id, user_id);
        assert!(user.active);

        let found = User::find_by_uuid(&db, user_id).await.unwrap().unwrap();
        assert_eq!(found.email, "john.doe@example.com");
        assert_eq!(found.timezone, "America/New_York");
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let db = setup_db().await;
        User::create(&db, &sample_user(), Uuid::new_v4())
            .await
            .unwrap();
        let err = User::create(&db, &sample_user(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::DuplicateEmail));
    }

    #[tokio::test]
    async fn find_active_excludes_deactivated_users() {
        let db = setup_db().await;
        let active_id = Uuid::new_v4();
        User::create(&db, &sample_user(), active_id).await.unwrap();

        let inactive = CreateUser {
            email: "jane.doe@example.com".to_string(),
            active: Some(false),
            ..sample_user()
        };
        User::create(&db, &inactive, Uuid::new_v4()).await.unwrap();

        let active = User::find_active(&db).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, active_id);
    }

    #[tokio::test]
    async fn update_applies_partial_changes() {
        let db = setup_db().await;
        let user_id = Uuid::new_v4();
        User::create(&db, &sample_user(), user_id).await.unwrap();

        let updated = User::update(
            &db,
            user_id,
            &UpdateUser {
                first_name: None,
                last_name: None,
                email: None,
                birthday: None,
                timezone: Some("Europe/London".to_string()),
                active: Some(false),
            },
        )
        .await
        .unwrap();

        assert_eq!(updated.timezone, "Europe/London");
        assert!(!updated.active);
        assert_eq!(updated.first_name, "John");
    }

    #[tokio::test]
    async fn delete_missing_user_is_not_found() {
        let db = setup_db().await;
        let err = User::delete(&db, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, UserError::NotFound));
    }
}
