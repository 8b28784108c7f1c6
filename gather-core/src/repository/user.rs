use sqlx::{postgres::PgRow, PgPool, Row};

use crate::{
    models::{User, UserId},
    Result,
};

/// User repository for database operations
#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new user
    pub async fn create(
        &self,
        username: &str,
        password_hash: &str,
        display_name: &str,
        profile_color_index: u8,
    ) -> Result<User> {
        let row = sqlx::query(
            r"
            INSERT INTO users (username, password_hash, display_name, profile_color_index)
            VALUES ($1, $2, $3, $4)
            RETURNING id, username, password_hash, display_name, profile_color_index,
                      created_at, updated_at
            ",
        )
        .bind(username)
        .bind(password_hash)
        .bind(display_name)
        .bind(i16::from(profile_color_index))
        .fetch_one(&self.pool)
        .await?;

        row_to_user(&row)
    }

    pub async fn get(&self, id: UserId) -> Result<User> {
        let row = sqlx::query(
            r"
            SELECT id, username, password_hash, display_name, profile_color_index,
                   created_at, updated_at
            FROM users
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        row_to_user(&row)
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r"
            SELECT id, username, password_hash, display_name, profile_color_index,
                   created_at, updated_at
            FROM users
            WHERE username = $1
            ",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    pub async fn list(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(
            r"
            SELECT id, username, password_hash, display_name, profile_color_index,
                   created_at, updated_at
            FROM users
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_user).collect()
    }

    pub async fn update_display_name(&self, id: UserId, display_name: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE users
            SET display_name = $2, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(display_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_password(&self, id: UserId, password_hash: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE users
            SET password_hash = $2, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(password_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a user; owned chatrooms and chats cascade.
    pub async fn delete(&self, id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_user(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        display_name: row.try_get("display_name")?,
        profile_color_index: row.try_get::<i16, _>("profile_color_index")? as u8,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {

    #[tokio::test]
    #[ignore = "Requires database"]
    async fn test_create_user() {
        // Integration test placeholder
    }
}
