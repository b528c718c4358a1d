//! Push payload translation.
//!
//! The bridge is stateless. Payloads become [`NotificationDescriptor`]s and
//! user interactions become [`NavigationIntent`]s; showing notifications and
//! navigating is the host's job.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::NotificationConfig;

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Where a click on this action leads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Notification the host should display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDescriptor {
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub tag: Option<String>,
    /// Where a click on the notification itself leads.
    pub url: Option<String>,
    pub actions: Vec<NotificationAction>,
}

/// What the user did with a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interaction {
    Click { action: Option<String> },
    Dismiss,
}

/// Navigation the host should perform, e.g. `open /products`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationIntent(pub String);

impl NavigationIntent {
    pub fn open(url: &str) -> Self {
        Self(format!("open {url}"))
    }

    /// Target of the intent.
    pub fn target(&self) -> &str {
        self.0.strip_prefix("open ").unwrap_or(&self.0)
    }
}

impl fmt::Display for NavigationIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationBridge {
    defaults: NotificationConfig,
}

impl NotificationBridge {
    pub fn new(defaults: NotificationConfig) -> Self {
        Self { defaults }
    }

    /// Translate a push payload. JSON objects are read field by field (a
    /// nested `notification` object takes precedence); anything else becomes
    /// the body.
    pub fn descriptor(&self, payload: &[u8]) -> NotificationDescriptor {
        match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(fields)) => self.read_fields(&fields),
            Ok(Value::String(text)) => self.plain(text),
            Ok(Value::Null) => self.plain(String::new()),
            Ok(other) => self.plain(other.to_string()),
            Err(_) => self.plain(String::from_utf8_lossy(payload).trim().to_string()),
        }
    }

    /// Navigation for an interaction. Dismissals navigate nowhere.
    pub fn intent(
        &self,
        notification: &NotificationDescriptor,
        interaction: &Interaction,
    ) -> Option<NavigationIntent> {
        let Interaction::Click { action } = interaction else {
            debug!(tag = ?notification.tag, "Notification dismissed");
            return None;
        };
        let action_url = action.as_deref().and_then(|name| {
            notification
                .actions
                .iter()
                .find(|a| a.action == name)
                .and_then(|a| a.url.as_deref())
        });
        let target = action_url
            .or(notification.url.as_deref())
            .unwrap_or("/");
        let intent = NavigationIntent::open(target);
        debug!(tag = ?notification.tag, ?action, intent = %intent, "Notification clicked");
        Some(intent)
    }

    fn plain(&self, body: String) -> NotificationDescriptor {
        NotificationDescriptor {
            title: self.defaults.default_title.clone(),
            body,
            icon: self.defaults.default_icon.clone(),
            badge: self.defaults.default_badge.clone(),
            tag: None,
            url: None,
            actions: Vec::new(),
        }
    }

    fn read_fields(&self, root: &Map<String, Value>) -> NotificationDescriptor {
        let nested = root.get("notification").and_then(Value::as_object);
        let data = root.get("data").and_then(Value::as_object);
        let field = |name: &str| {
            nested
                .and_then(|n| string(n, name))
                .or_else(|| string(root, name))
        };

        let url = field("url")
            .or_else(|| field("click_action"))
            .or_else(|| data.and_then(|d| string(d, "url")));
        let actions = nested
            .and_then(|n| n.get("actions"))
            .or_else(|| root.get("actions"))
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(action).collect())
            .unwrap_or_default();

        NotificationDescriptor {
            title: field("title").unwrap_or_else(|| self.defaults.default_title.clone()),
            body: field("body").unwrap_or_default(),
            icon: field("icon").or_else(|| self.defaults.default_icon.clone()),
            badge: field("badge").or_else(|| self.defaults.default_badge.clone()),
            tag: field("tag"),
            url,
            actions,
        }
    }
}

fn string(fields: &Map<String, Value>, name: &str) -> Option<String> {
    match fields.get(name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn action(value: &Value) -> Option<NotificationAction> {
    let fields = value.as_object()?;
    let action = string(fields, "action")?;
    Some(NotificationAction {
        title: string(fields, "title").unwrap_or_else(|| action.clone()),
        icon: string(fields, "icon"),
        url: string(fields, "url"),
        action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> NotificationBridge {
        NotificationBridge::new(NotificationConfig {
            default_title: "Shop".to_string(),
            default_icon: Some("/icon.png".to_string()),
            default_badge: None,
        })
    }

    #[test]
    fn test_full_json_payload() {
        let payload = br#"{
            "title": "Sale",
            "body": "50% off",
            "tag": "promo",
            "url": "/sale",
            "actions": [
                { "action": "view", "title": "View", "url": "/products" },
                { "action": "later" },
                { "title": "missing action name" }
            ]
        }"#;
        let n = bridge().descriptor(payload);

        assert_eq!(n.title, "Sale");
        assert_eq!(n.body, "50% off");
        assert_eq!(n.icon.as_deref(), Some("/icon.png"));
        assert_eq!(n.tag.as_deref(), Some("promo"));
        assert_eq!(n.actions.len(), 2);
        assert_eq!(n.actions[1].title, "later");
    }

    #[test]
    fn test_nested_notification_object() {
        let payload = br#"{
            "notification": { "title": "Order shipped", "icon": "/truck.png" },
            "data": { "url": "/orders/7" }
        }"#;
        let n = bridge().descriptor(payload);
        assert_eq!(n.title, "Order shipped");
        assert_eq!(n.icon.as_deref(), Some("/truck.png"));
        assert_eq!(n.url.as_deref(), Some("/orders/7"));
        assert_eq!(n.body, "");
    }

    #[test]
    fn test_non_json_payload_becomes_body() {
        let n = bridge().descriptor(b"  Your cart misses you  ");
        assert_eq!(n.title, "Shop");
        assert_eq!(n.body, "Your cart misses you");

        assert_eq!(bridge().descriptor(br#""quoted""#).body, "quoted");
        assert_eq!(bridge().descriptor(b"42").body, "42");
    }

    #[test]
    fn test_click_intents() {
        let bridge = bridge();
        let n = bridge.descriptor(
            br#"{"url": "/sale", "actions": [{"action": "view", "url": "/products"}, {"action": "x"}]}"#,
        );

        let click = |action: Option<&str>| Interaction::Click {
            action: action.map(str::to_string),
        };
        assert_eq!(bridge.intent(&n, &click(Some("view"))).unwrap().0, "open /products");
        assert_eq!(bridge.intent(&n, &click(Some("x"))).unwrap().0, "open /sale");
        assert_eq!(bridge.intent(&n, &click(None)).unwrap().target(), "/sale");
        assert_eq!(bridge.intent(&n, &Interaction::Dismiss), None);

        let bare = bridge.descriptor(b"hello");
        assert_eq!(bridge.intent(&bare, &click(None)).unwrap().0, "open /");
    }
}
