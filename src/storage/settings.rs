use anyhow::Result;

use super::schema::Database;

/// Settings key holding the automation rules as a JSON array
pub const RULES_KEY: &str = "rules";
/// `"true"` enables title translation during refresh
pub const TRANSLATION_ENABLED_KEY: &str = "translation_enabled";
/// Target language code for title translation
pub const TARGET_LANGUAGE_KEY: &str = "target_language";
/// Retention window (days) used by the cleanup pass
pub const MAX_ARTICLE_AGE_DAYS_KEY: &str = "max_article_age_days";

impl Database {
    // ========================================================================
    // Settings Operations
    // ========================================================================

    /// Get a single setting value by key.
    ///
    /// # Returns
    ///
    /// The setting value if the key exists, or `None` if not set.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }

    /// Set a setting value (UPSERT).
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Read a boolean setting stored as `"true"` / `"false"`.
    pub async fn get_bool_setting(&self, key: &str) -> Result<bool> {
        Ok(self
            .get_setting(key)
            .await?
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true")))
    }
}
