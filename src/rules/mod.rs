//! Automation rules applied to newly fetched articles.
//!
//! A rule is an ordered condition list plus named actions. Conditions are
//! folded left to right with per-condition `and` / `or`; the first enabled
//! rule that matches an article has all its actions applied and later rules
//! are not consulted for that article.
//!
//! Rules live as a JSON array in the `rules` setting:
//!
//! ```json
//! [{
//!   "name": "Favorite AI news",
//!   "enabled": true,
//!   "conditions": [
//!     {"field": "feed_category", "value": "Tech"},
//!     {"field": "article_title", "operator": "contains", "value": "AI", "logic": "and"}
//!   ],
//!   "actions": ["favorite"]
//! }]
//! ```

mod engine;
mod model;

pub use engine::{parse_rules, resolve_action, save_rules, RuleEngine, RuleError, RuleStore};
pub use model::{evaluate, Condition, ConditionField, FeedLabel, Logic, MatchOperator, Rule};
