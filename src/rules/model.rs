use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::storage::Article;

/// User-defined automation rule.
///
/// Stored as one element of the JSON array under the `rules` setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub name: String,
    pub enabled: bool,
    pub conditions: Vec<Condition>,
    /// Action names, see [`resolve_action`](super::resolve_action)
    pub actions: Vec<String>,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Condition {
    pub field: ConditionField,
    pub operator: MatchOperator,
    pub value: String,
    /// Alternatives for feed name / category / title, any one matching is enough
    pub values: Vec<String>,
    /// How this condition joins the result of the conditions before it
    pub logic: Logic,
    pub negate: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    FeedName,
    FeedCategory,
    #[default]
    ArticleTitle,
    PublishedAfter,
    PublishedBefore,
    IsRead,
    IsFavorite,
    IsHidden,
    IsReadLater,
    /// Field name this version does not know; never matches
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOperator {
    #[default]
    Contains,
    Exact,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    #[default]
    And,
    Or,
}

/// Feed attributes a condition can test
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedLabel {
    pub name: String,
    pub category: String,
}

/// Evaluate a condition list against one article.
///
/// Conditions fold left to right: the first seeds the result and each later
/// one joins with its own `logic`. `negate` flips a condition before it is
/// folded in. An empty list never matches.
pub fn evaluate(conditions: &[Condition], article: &Article, feed: &FeedLabel) -> bool {
    let mut iter = conditions.iter();
    let Some(first) = iter.next() else {
        return false;
    };

    let mut result = first.matches(article, feed);
    for condition in iter {
        let value = condition.matches(article, feed);
        result = match condition.logic {
            Logic::And => result && value,
            Logic::Or => result || value,
        };
    }
    result
}

impl Condition {
    /// Result of this condition alone, `negate` applied.
    pub fn matches(&self, article: &Article, feed: &FeedLabel) -> bool {
        self.raw_match(article, feed) != self.negate
    }

    fn options(&self) -> Vec<&str> {
        let values: Vec<&str> = self
            .values
            .iter()
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .collect();
        if !values.is_empty() {
            return values;
        }
        let value = self.value.trim();
        if value.is_empty() {
            Vec::new()
        } else {
            vec![value]
        }
    }

    fn raw_match(&self, article: &Article, feed: &FeedLabel) -> bool {
        if self.field == ConditionField::Unknown {
            tracing::warn!("Rule condition uses an unknown field");
            return false;
        }

        let options = self.options();
        // No value configured: the condition does not constrain anything
        if options.is_empty() {
            return true;
        }
        let value = options[0];

        match self.field {
            ConditionField::FeedName => contains_any(&feed.name, &options),
            ConditionField::FeedCategory => contains_any(&feed.category, &options),
            ConditionField::ArticleTitle => {
                let title = article.title.to_lowercase();
                options.iter().any(|option| {
                    let option = option.to_lowercase();
                    match self.operator {
                        MatchOperator::Contains => title.contains(&option),
                        MatchOperator::Exact => title.trim() == option,
                    }
                })
            }
            ConditionField::PublishedAfter => match (parse_date(value), article.published_at) {
                (Some(date), Some(published)) => {
                    published >= date.and_time(NaiveTime::MIN).and_utc().timestamp()
                }
                _ => false,
            },
            ConditionField::PublishedBefore => match (parse_date(value), article.published_at) {
                (Some(date), Some(published)) => DateTime::from_timestamp(published, 0)
                    .is_some_and(|published| published.date_naive() <= date),
                _ => false,
            },
            ConditionField::IsRead => flag_matches(article.is_read, value),
            ConditionField::IsFavorite => flag_matches(article.is_favorite, value),
            ConditionField::IsHidden => flag_matches(article.is_hidden, value),
            ConditionField::IsReadLater => flag_matches(article.is_read_later, value),
            ConditionField::Unknown => false,
        }
    }
}

fn contains_any(haystack: &str, options: &[&str]) -> bool {
    let haystack = haystack.to_lowercase();
    options
        .iter()
        .any(|option| haystack.contains(&option.to_lowercase()))
}

fn flag_matches(flag: bool, value: &str) -> bool {
    match value {
        "true" => flag,
        "false" => !flag,
        _ => false,
    }
}

/// Accepts `YYYY-MM-DD`, RFC 3339 and `YYYY-MM-DDTHH:MM`; only the date part
/// is used.
fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.date_naive()))
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M")
                .ok()
                .map(|dt| dt.date())
        })
}
