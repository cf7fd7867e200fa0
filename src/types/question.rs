//! `AskUserQuestion` records
//!
//! The CLI asks clarifying questions through its `AskUserQuestion` tool, which
//! reaches the permission bridge like any other tool call. The input holds
//! multiple-choice questions; an allow decision carries the user's answers
//! back in `updatedInput`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::permission::PermissionDecision;

/// Tool name of the CLI's clarifying-question tool
pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

/// One question from an `AskUserQuestion` input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuestion {
    pub question: String,
    /// Short label shown above the question
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

impl UserQuestion {
    /// Questions of an `AskUserQuestion` input
    ///
    /// `None` when `questions` is missing, malformed or empty.
    pub fn parse_all(input: &Value) -> Option<Vec<Self>> {
        let questions: Vec<Self> = serde_json::from_value(input.get("questions")?.clone()).ok()?;
        (!questions.is_empty()).then_some(questions)
    }

    /// Turn a typed reply into an answer
    ///
    /// Option numbers map to their labels (several, comma separated, only for
    /// multi-select questions). Any other reply is a free-form answer.
    pub fn answer_from_reply(&self, reply: &str) -> String {
        let reply = reply.trim();
        let labels: Option<Vec<&str>> = reply
            .split(',')
            .map(|pick| {
                let index = pick.trim().parse::<usize>().ok()?.checked_sub(1)?;
                self.options.get(index).map(|option| option.label.as_str())
            })
            .collect();
        match labels {
            Some(labels) if labels.len() == 1 || self.multi_select => labels.join(", "),
            _ => reply.to_string(),
        }
    }
}

/// Allow decision answering an `AskUserQuestion` call
///
/// `answers` maps each question's text to its answer.
pub fn questions_answered(input: &Value, answers: Map<String, Value>) -> PermissionDecision {
    let questions = input.get("questions").cloned().unwrap_or(Value::Null);
    PermissionDecision::allow_with(serde_json::json!({
        "questions": questions,
        "answers": answers,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn color_question(multi_select: bool) -> UserQuestion {
        UserQuestion {
            question: "Which colors?".into(),
            header: "Colors".into(),
            options: ["Red", "Green", "Blue"]
                .iter()
                .map(|label| QuestionOption {
                    label: (*label).to_string(),
                    description: String::new(),
                })
                .collect(),
            multi_select,
        }
    }

    #[test]
    fn test_parse_all() {
        let input = json!({
            "questions": [{
                "question": "Which database?",
                "header": "Database",
                "options": [{"label": "Postgres", "description": "relational"}],
                "multiSelect": true
            }]
        });
        let questions = UserQuestion::parse_all(&input).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].header, "Database");
        assert_eq!(questions[0].options[0].label, "Postgres");
        assert!(questions[0].multi_select);

        assert!(UserQuestion::parse_all(&json!({})).is_none());
        assert!(UserQuestion::parse_all(&json!({"questions": []})).is_none());
        assert!(UserQuestion::parse_all(&json!({"questions": "what?"})).is_none());
    }

    #[test]
    fn test_answer_from_reply() {
        let single = color_question(false);
        assert_eq!(single.answer_from_reply("2"), "Green");
        assert_eq!(single.answer_from_reply(" 3 "), "Blue");
        // Out of range or several picks on a single-select question stay free-form
        assert_eq!(single.answer_from_reply("7"), "7");
        assert_eq!(single.answer_from_reply("1,2"), "1,2");
        assert_eq!(single.answer_from_reply("Purple please"), "Purple please");

        let multi = color_question(true);
        assert_eq!(multi.answer_from_reply("1, 3"), "Red, Blue");
    }

    #[test]
    fn test_questions_answered_shape() {
        let input = json!({"questions": [{"question": "Which colors?", "header": "Colors"}]});
        let mut answers = Map::new();
        answers.insert("Which colors?".into(), json!("Red"));

        let decision = questions_answered(&input, answers);
        assert_eq!(
            serde_json::to_value(&decision).unwrap(),
            json!({
                "behavior": "allow",
                "updatedInput": {
                    "questions": [{"question": "Which colors?", "header": "Colors"}],
                    "answers": {"Which colors?": "Red"}
                }
            })
        );
    }
}
