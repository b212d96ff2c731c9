use regex::Regex;

/// Labels produced by the built-in `intent_classifier` capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    /// Small talk; planners answer it with a plain reply.
    Greeting,
    DevOn,
    DevOff,
    CodeOn,
    CodeOff,
    GeneralOn,
    GeneralOff,
    /// Anything else; goes to the planner.
    Generic,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::DevOn => "dev_on",
            Intent::DevOff => "dev_off",
            Intent::CodeOn => "code_on",
            Intent::CodeOff => "code_off",
            Intent::GeneralOn => "general_on",
            Intent::GeneralOff => "general_off",
            Intent::Generic => "generic",
        }
    }

    pub fn parse(label: &str) -> Intent {
        match label.trim() {
            "greeting" => Intent::Greeting,
            "dev_on" => Intent::DevOn,
            "dev_off" => Intent::DevOff,
            "code_on" => Intent::CodeOn,
            "code_off" => Intent::CodeOff,
            "general_on" => Intent::GeneralOn,
            "general_off" => Intent::GeneralOff,
            _ => Intent::Generic,
        }
    }
}

struct IntentRule {
    intent: Intent,
    patterns: Vec<Regex>,
    priority: u8,
}

pub struct IntentClassifier {
    rules: Vec<IntentRule>,
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

const ON: &str = r"(?:enable|turn\s+on|switch\s+on|switch\s+to|activate|enter|start|go\s+to|use)";
const OFF: &str = r"(?:disable|turn\s+off|switch\s+off|deactivate|exit|leave|stop|quit)";
const TAIL: &str = r"(?:\s+(?:mode|profile))?[\s.!]*$";

fn toggle(verb: &str, subject: &str) -> Regex {
    Regex::new(&format!(
        r"(?i)^(?:please\s+)?{}\s+(?:the\s+)?{}{}",
        verb, subject, TAIL
    ))
    .unwrap()
}

impl IntentClassifier {
    pub fn new() -> Self {
        let dev = r"(?:dev|developer|capability[\s_-]?dev)";
        let code = r"(?:code|coding|code[\s_-]?dev)";
        let general = r"general";

        let rules = vec![
            IntentRule {
                intent: Intent::DevOn,
                patterns: vec![toggle(ON, dev)],
                priority: 20,
            },
            IntentRule {
                intent: Intent::DevOff,
                patterns: vec![toggle(OFF, dev)],
                priority: 20,
            },
            IntentRule {
                intent: Intent::CodeOn,
                patterns: vec![toggle(ON, code)],
                priority: 20,
            },
            IntentRule {
                intent: Intent::CodeOff,
                patterns: vec![toggle(OFF, code)],
                priority: 20,
            },
            IntentRule {
                intent: Intent::GeneralOn,
                patterns: vec![
                    toggle(ON, general),
                    Regex::new(r"(?i)^(?:go\s+)?back\s+to\s+(?:the\s+)?general(?:\s+(?:mode|profile))?[\s.!]*$").unwrap(),
                ],
                priority: 20,
            },
            IntentRule {
                intent: Intent::GeneralOff,
                patterns: vec![toggle(OFF, general)],
                priority: 20,
            },
            IntentRule {
                intent: Intent::Greeting,
                patterns: vec![
                    Regex::new(r"(?i)^(hi|hello|hey|howdy|yo|greetings|good\s*(morning|afternoon|evening))(\s+there)?[\s!.,?~]*$").unwrap(),
                    Regex::new(r"(?i)^(thanks|thank\s*you|thx|ok|okay|got\s*it|cool|nice)[\s!.~]*$").unwrap(),
                    Regex::new(r"(?i)^(bye|goodbye|see\s*you|good\s*night)[\s!.~]*$").unwrap(),
                    Regex::new(r"(?i)^(how\s+are\s+you|what'?s\s+up|who\s+are\s+you)[\s?!.]*$").unwrap(),
                ],
                priority: 10,
            },
        ];

        Self { rules }
    }

    /// Like `classify`, but a greeting-shaped reply ("ok", "thanks") to an
    /// open assistant question is an answer, so it is `Generic`.
    pub fn classify_in_context(&self, history: &str, input: &str) -> Intent {
        match self.classify(input) {
            Intent::Greeting if ends_with_question(history) => Intent::Generic,
            intent => intent,
        }
    }

    /// Highest-priority matching label, `Generic` if nothing matches.
    pub fn classify(&self, input: &str) -> Intent {
        let input = input.trim();
        self.rules
            .iter()
            .filter(|rule| rule.patterns.iter().any(|p| p.is_match(input)))
            .max_by_key(|rule| rule.priority)
            .map(|rule| rule.intent)
            .unwrap_or(Intent::Generic)
    }
}

/// Whether the last assistant entry of a rendered `sender: text` history
/// asks something. Later user entries do not close the question.
fn ends_with_question(history: &str) -> bool {
    let last = match history.rfind("\nassistant: ") {
        Some(at) => &history[at + 1..],
        None if history.starts_with("assistant: ") => history,
        None => return false,
    };
    let reply = last.split("\nuser: ").next().unwrap_or(last);
    reply.trim_end().ends_with('?')
}
