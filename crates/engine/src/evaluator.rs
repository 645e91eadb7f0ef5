use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::debug;

use nurture_core::types::PurchaseSet;

use crate::types::Engagement;

/// Branch condition carried by a `condition` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "conditionType")]
pub enum Condition {
    /// Opened a specific earlier email node, or any email when unset/"any".
    OpenedEmail {
        #[serde(default, rename = "emailNodeId")]
        email_node_id: Option<String>,
    },
    ClickedLink {
        #[serde(default, rename = "emailNodeId")]
        email_node_id: Option<String>,
        /// Substring matched against clicked URLs.
        #[serde(default, rename = "linkUrl")]
        link_url: Option<String>,
    },
    HasTag {
        #[serde(rename = "tagId")]
        tag_id: String,
    },
    #[serde(alias = "has_purchased_product")]
    HasPurchased {
        #[serde(default, rename = "productId")]
        product_id: Option<String>,
        #[serde(default, rename = "courseId")]
        course_id: Option<String>,
    },
    TimeBased {
        #[serde(default, rename = "timeOperator")]
        operator: TimeOperator,
        #[serde(default, rename = "timeDays")]
        days: u32,
        /// When present, the condition is day-of-week membership instead.
        #[serde(default, rename = "daysOfWeek")]
        days_of_week: Option<Vec<Weekday>>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOperator {
    #[default]
    GreaterThan,
    LessThan,
    Equals,
}

/// Everything a condition may look at, captured before evaluation.
#[derive(Debug, Clone)]
pub struct ContactSnapshot {
    pub tag_ids: BTreeSet<String>,
    pub purchases: PurchaseSet,
    pub engagement: Engagement,
    pub enrolled_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// Resolves condition nodes against contact snapshots.
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, condition: &Condition, snapshot: &ContactSnapshot) -> bool {
        let result = match condition {
            Condition::OpenedEmail { email_node_id } => match specific(email_node_id) {
                Some(node_id) => snapshot.engagement.opened_nodes.contains(node_id),
                None => !snapshot.engagement.opened_nodes.is_empty(),
            },
            Condition::ClickedLink {
                email_node_id,
                link_url,
            } => {
                let node = specific(email_node_id);
                match link_url.as_deref().filter(|u| !u.is_empty()) {
                    Some(url) => snapshot.engagement.clicked_links.iter().any(|click| {
                        node.map_or(true, |n| click.node_id == n) && click.url.contains(url)
                    }),
                    None => match node {
                        Some(node_id) => snapshot.engagement.clicked_nodes.contains(node_id),
                        None => !snapshot.engagement.clicked_nodes.is_empty(),
                    },
                }
            }
            Condition::HasTag { tag_id } => snapshot.tag_ids.contains(tag_id),
            Condition::HasPurchased {
                product_id,
                course_id,
            } => match (product_id, course_id) {
                (Some(product), _) => snapshot.purchases.product_ids.contains(product),
                (None, Some(course)) => snapshot.purchases.course_ids.contains(course),
                (None, None) => !snapshot.purchases.is_empty(),
            },
            Condition::TimeBased {
                operator,
                days,
                days_of_week,
            } => match days_of_week {
                Some(allowed) => allowed.contains(&snapshot.now.weekday()),
                None => {
                    let elapsed = snapshot.now - snapshot.enrolled_at;
                    let elapsed_days = elapsed.num_seconds() as f64 / 86_400.0;
                    match operator {
                        TimeOperator::GreaterThan => elapsed_days > f64::from(*days),
                        TimeOperator::LessThan => elapsed_days < f64::from(*days),
                        TimeOperator::Equals => elapsed.num_days() == i64::from(*days),
                    }
                }
            },
        };

        debug!(condition = ?condition, result, "Condition resolved");
        result
    }
}

fn specific(node_id: &Option<String>) -> Option<&str> {
    node_id
        .as_deref()
        .filter(|id| !id.is_empty() && *id != "any")
}
