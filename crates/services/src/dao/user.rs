use bson::{DateTime, doc, oid::ObjectId};
use connect_db::models::User;
use mongodb::Database;
use std::sync::Arc;

use super::base::{BaseDao, DaoResult, DbGuard};

pub struct UserDao {
    pub base: BaseDao<User>,
}

impl UserDao {
    pub fn new(db: &Database, guard: Arc<DbGuard>) -> Self {
        Self {
            base: BaseDao::new(db, User::COLLECTION, guard),
        }
    }

    pub async fn create(
        &self,
        email: String,
        display_name: String,
        password_hash: String,
    ) -> DaoResult<User> {
        let now = DateTime::now();
        let user = User {
            id: None,
            email,
            display_name,
            picture: None,
            password_hash: Some(password_hash),
            last_active_at: None,
            created_at: now,
            updated_at: now,
        };
        let id = self.base.insert_one(&user).await?;
        self.base.find_by_id(id).await
    }

    pub async fn find_by_email(&self, email: &str) -> DaoResult<User> {
        self.base
            .find_one(doc! { "email": email })
            .await?
            .ok_or(super::base::DaoError::NotFound)
    }

    pub async fn touch_last_active(&self, user_id: ObjectId) -> DaoResult<bool> {
        self.base
            .update_by_id(
                user_id,
                doc! { "$set": { "last_active_at": DateTime::now() } },
            )
            .await
    }
}
