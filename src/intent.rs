use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Schedule,
    Expense,
}

impl IntentKind {
    pub fn as_label(self) -> &'static str {
        match self {
            IntentKind::Schedule => "schedule",
            IntentKind::Expense => "expense",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentMatch {
    pub kind: IntentKind,
    pub reply: String,
}

/// Consulted once per message before any provider is chosen. A match answers the message
/// directly.
pub trait IntentClassifier: Send + Sync {
    fn classify(&self, message: &str) -> Option<IntentMatch>;
}

/// Regex heuristics for reminders and spending notes.
pub struct KeywordIntentClassifier {
    schedule: Regex,
    expense: Regex,
}

impl KeywordIntentClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            schedule: Regex::new(
                r"(?i)\b(remind me|set (a )?reminder|schedule|meeting (at|on|with)|appointment)\b|\b\d{1,2}(:\d{2})?\s?(am|pm)\b",
            )?,
            expense: Regex::new(
                r"(?i)\b(spent|paid|bought|expense)\b.*(\d|₹|\$|rs\.?)|(₹|rs\.?\s?)\d+",
            )?,
        })
    }
}

impl IntentClassifier for KeywordIntentClassifier {
    fn classify(&self, message: &str) -> Option<IntentMatch> {
        if self.schedule.is_match(message) {
            return Some(IntentMatch {
                kind: IntentKind::Schedule,
                reply: "Got it! I've added that to your schedule.".into(),
            });
        }
        if self.expense.is_match(message) {
            return Some(IntentMatch {
                kind: IntentKind::Expense,
                reply: "Noted! I've logged that expense for you.".into(),
            });
        }
        None
    }
}
