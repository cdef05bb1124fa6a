use sqlx::MySqlConnection;

use super::repo_types::User;

impl User {
    /// Insert a user and read it back with its server-assigned timestamps.
    /// `password` is stored exactly as given.
    pub async fn create(
        conn: &mut MySqlConnection,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<User, sqlx::Error> {
        let id = sqlx::query(
            r#"
            INSERT INTO users (username, email, password)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(username)
        .bind(email)
        .bind(password)
        .execute(&mut *conn)
        .await?
        .last_insert_id();

        User::find_by_id(conn, id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find_by_id(conn: &mut MySqlConnection, id: u64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password, created_at, updated_at, deleted_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(conn)
        .await
    }

    pub async fn find_by_username(
        conn: &mut MySqlConnection,
        username: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password, created_at, updated_at, deleted_at
            FROM users
            WHERE username = ?
            "#,
        )
        .bind(username)
        .fetch_optional(conn)
        .await
    }

    pub async fn find_by_email(
        conn: &mut MySqlConnection,
        email: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password, created_at, updated_at, deleted_at
            FROM users
            WHERE email = ?
            "#,
        )
        .bind(email)
        .fetch_optional(conn)
        .await
    }

    /// Mark a live row as deleted. Returns false when no live row matched.
    pub async fn soft_delete(conn: &mut MySqlConnection, id: u64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET deleted_at = CURRENT_TIMESTAMP
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
