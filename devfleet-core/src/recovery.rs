//! Alert recovery.
//!
//! A rule table maps known GUI alerts to the button to press. Anything the
//! table does not recognise, and any alert seen twice in one install
//! session, is a [`RecoveryError`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{error::RecoveryError, tools::Alert};

static PARTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"“[^”]*”|[^ “]+").expect("alert parts regex should compile")
});

/// Which alert text a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertField {
    Message,
    Details,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    /// Press `choice`, ticking `options` first.
    Respond {
        choice: String,
        #[serde(default)]
        options: Vec<String>,
    },
    /// Abandon the install batch.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRule {
    pub name: String,
    pub field: AlertField,
    /// Substring the field must contain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    /// Exact text the field must equal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<String>,
    pub action: RuleAction,
}

impl RecoveryRule {
    /// Rules for the alerts the install GUI is known to raise.
    pub fn builtin() -> Vec<Self> {
        vec![
            RecoveryRule {
                name: "unknown-error".to_owned(),
                field: AlertField::Any,
                contains: None,
                equals: Some("unknown error".to_owned()),
                action: RuleAction::Fatal,
            },
            RecoveryRule {
                name: "app-already-installed".to_owned(),
                field: AlertField::Message,
                contains: Some("already exists on".to_owned()),
                equals: None,
                action: RuleAction::Respond {
                    choice: "Skip App".to_owned(),
                    options: vec!["Apply to all apps".to_owned()],
                },
            },
            RecoveryRule {
                name: "transient-network-error".to_owned(),
                field: AlertField::Details,
                contains: Some("An unexpected network error occurred".to_owned()),
                equals: None,
                action: RuleAction::Respond {
                    choice: "Try Again".to_owned(),
                    options: Vec::new(),
                },
            },
        ]
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        let fields: &[&str] = match self.field {
            AlertField::Message => &[alert.message.as_str()],
            AlertField::Details => &[alert.details.as_str()],
            AlertField::Any => &[alert.message.as_str(), alert.details.as_str()],
        };
        fields.iter().any(|text| {
            let equal = self.equals.as_deref().is_none_or(|e| *text == e);
            let contained = self.contains.as_deref().is_none_or(|c| text.contains(c));
            equal && contained && (self.equals.is_some() || self.contains.is_some())
        })
    }
}

/// Button press that dismisses an alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub choice: String,
    pub options: Vec<String>,
}

/// Answer `alert` from `rules`; first match wins.
pub fn decide(rules: &[RecoveryRule], alert: &Alert) -> Result<Response, RecoveryError> {
    let Some(rule) = rules.iter().find(|rule| rule.matches(alert)) else {
        error!(alert = %alert, "no recovery rule matches alert");
        return Err(RecoveryError::new(alert.to_string()));
    };
    match &rule.action {
        RuleAction::Respond { choice, options } => {
            debug!(rule = %rule.name, choice = %choice, "recovering from alert");
            Ok(Response {
                choice: choice.clone(),
                options: options.clone(),
            })
        }
        RuleAction::Fatal => {
            error!(rule = %rule.name, alert = %alert, "fatal alert");
            Err(RecoveryError::new(alert.to_string()))
        }
    }
}

/// Recovery state for one install session.
#[derive(Debug)]
pub struct RecoverySession<'a> {
    rules: &'a [RecoveryRule],
    handled: Vec<Alert>,
}

impl<'a> RecoverySession<'a> {
    pub fn new(rules: &'a [RecoveryRule]) -> Self {
        Self {
            rules,
            handled: Vec::new(),
        }
    }

    /// Like [`decide`], but an alert identical to one already answered in
    /// this session is unrecoverable.
    pub fn decide(&mut self, alert: &Alert) -> Result<Response, RecoveryError> {
        if self.handled.iter().any(|seen| same_alert(seen, alert)) {
            error!(alert = %alert, "same alert occurred again");
            return Err(RecoveryError::new(alert.to_string()));
        }
        self.handled.push(alert.clone());
        decide(self.rules, alert)
    }
}

/// Words of `text`, keeping “quoted phrases” whole.
pub fn parts(text: &str) -> Vec<&str> {
    PARTS.find_iter(text).map(|m| m.as_str()).collect()
}

/// Percentage of positionally identical parts, relative to the longer text.
pub fn similarity(x: &str, y: &str) -> f64 {
    if x == y {
        return 100.0;
    }
    let (a, b) = (parts(x), parts(y));
    let most = a.len().max(b.len());
    if most == 0 {
        return 100.0;
    }
    let matching = a.iter().zip(&b).filter(|(p, q)| p == q).count();
    matching as f64 / most as f64 * 100.0
}

fn alert_similarity(x: &Alert, y: &Alert) -> f64 {
    (similarity(&x.message, &y.message) + similarity(&x.details, &y.details)) / 2.0
}

pub fn same_alert(x: &Alert, y: &Alert) -> bool {
    alert_similarity(x, y) >= 100.0
}

/// Alerts differing only in a quoted name or two.
pub fn similar_alerts(x: &Alert, y: &Alert) -> bool {
    alert_similarity(x, y) >= 75.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Vec<RecoveryRule> {
        RecoveryRule::builtin()
    }

    #[test]
    fn known_alerts_map_to_responses() {
        let exists = Alert::new("The app “Keynote” already exists on “Cart 3”.", "");
        assert_eq!(
            decide(&rules(), &exists).unwrap(),
            Response {
                choice: "Skip App".into(),
                options: vec!["Apply to all apps".into()],
            }
        );

        let network = Alert::new(
            "Unable to download apps.",
            "An unexpected network error occurred. Please try again.",
        );
        assert_eq!(decide(&rules(), &network).unwrap().choice, "Try Again");
    }

    #[test]
    fn unknown_and_fatal_alerts_are_errors() {
        let unknown = Alert::new("unknown error", "");
        assert!(decide(&rules(), &unknown).is_err());

        let strange = Alert::new("The operation couldn’t be completed.", "");
        let err = decide(&rules(), &strange).unwrap_err();
        assert!(err.alert.contains("couldn’t be completed"));
    }

    #[test]
    fn repeated_alert_in_one_session_is_unrecoverable() {
        let rules = rules();
        let mut session = RecoverySession::new(&rules);
        let alert = Alert::new("The app “Keynote” already exists on “Cart 3”.", "");
        assert!(session.decide(&alert).is_ok());

        let other = Alert::new("The app “Pages” already exists on “Cart 3”.", "");
        assert!(session.decide(&other).is_ok());

        assert!(session.decide(&alert).is_err());
    }

    #[test]
    fn parts_keep_quoted_phrases() {
        assert_eq!(
            parts("The app “Key note” already exists"),
            vec!["The", "app", "“Key note”", "already", "exists"]
        );
        let a = Alert::new("The app “Keynote” already exists on “Cart 3”.", "");
        let b = Alert::new("The app “Pages” already exists on “Cart 3”.", "");
        assert!(similar_alerts(&a, &b));
        assert!(!same_alert(&a, &b));
    }

    #[test]
    fn rule_table_round_trips_through_toml() {
        #[derive(Serialize, Deserialize)]
        struct Table {
            rules: Vec<RecoveryRule>,
        }
        let raw = toml::to_string(&Table { rules: rules() }).unwrap();
        let parsed: Table = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.rules, rules());
    }
}
