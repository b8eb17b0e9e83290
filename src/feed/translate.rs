use async_trait::async_trait;

use crate::storage::{Database, NewArticle, TARGET_LANGUAGE_KEY, TRANSLATION_ENABLED_KEY};

/// Language used when translation is on but no target is configured
pub const DEFAULT_TARGET_LANGUAGE: &str = "en";

/// Translation provider for article titles.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_lang: &str) -> anyhow::Result<String>;
}

/// Target language when title translation is switched on in settings.
///
/// Settings that cannot be read count as "off".
pub async fn configured_target_language(db: &Database) -> Option<String> {
    match db.get_bool_setting(TRANSLATION_ENABLED_KEY).await {
        Ok(true) => {}
        Ok(false) => return None,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read translation setting");
            return None;
        }
    }

    let target = db
        .get_setting(TARGET_LANGUAGE_KEY)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read target language");
            None
        })
        .filter(|lang| !lang.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TARGET_LANGUAGE.to_string());
    Some(target)
}

/// Fill `translated_title` for each article, returns how many succeeded.
///
/// Failures are logged and leave the article untranslated.
pub async fn translate_titles(
    translator: &dyn Translator,
    target_lang: &str,
    articles: &mut [NewArticle],
) -> usize {
    let mut translated = 0;
    for article in articles.iter_mut() {
        match translator.translate(&article.title, target_lang).await {
            Ok(text) if !text.trim().is_empty() => {
                article.translated_title = text.trim().to_string();
                translated += 1;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(url = %article.url, error = %e, "Title translation failed");
            }
        }
    }
    translated
}
