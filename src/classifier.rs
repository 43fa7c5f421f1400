//! Pure text classifier. No I/O: keyword tables are plain data here, fed
//! from the config layer at composition time rather than compiled in.

use crate::models::{Classification, Kind, Sentiment};

/// Keyword tables the classifier matches against. Loaded from the config
/// layer's `messages.json`/`commands.json` sections at startup.
#[derive(Debug, Clone)]
pub struct KeywordTables {
    pub command_prefixes: Vec<char>,
    pub greetings: Vec<String>,
    pub farewells: Vec<String>,
    pub question_markers: Vec<String>,
    pub help: Vec<String>,
    pub contextual: Vec<String>,
    pub positive: Vec<String>,
    pub negative: Vec<String>,
}

impl Default for KeywordTables {
    fn default() -> Self {
        KeywordTables {
            command_prefixes: vec!['!', '/'],
            greetings: strs(&["hola", "buenos dias", "buenas tardes", "buenas noches", "hello", "hi", "hey"]),
            farewells: strs(&["adios", "chau", "bye", "goodbye", "hasta luego", "nos vemos"]),
            question_markers: strs(&["?", "cual", "que", "como", "donde", "cuando", "quien", "porque", "where", "what", "how", "when", "who", "why"]),
            help: strs(&["ayuda", "help", "socorro"]),
            contextual: strs(&["triste", "aburrido", "sad", "bored", "chiste", "joke", "hora", "time"]),
            positive: strs(&["gracias", "genial", "excelente", "bien", "great", "thanks", "good", "awesome"]),
            negative: strs(&["mal", "terrible", "odio", "bad", "hate", "awful", "horrible"]),
        }
    }
}

fn strs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Lowercases and strips the common Spanish diacritics for
/// case-/diacritic-insensitive matching.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' => 'u',
            'ü' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

fn token_count(text: &str) -> usize {
    text.split_whitespace().count().max(1)
}

fn count_matches(haystack: &str, needles: &[String]) -> usize {
    needles.iter().filter(|n| haystack.contains(n.as_str())).count()
}

/// Deterministic, pure classification.
pub fn classify(text: &str, tables: &KeywordTables) -> Classification {
    let trimmed = text.trim();
    let normalized = normalize(trimmed);

    if let Some(first) = trimmed.chars().next() {
        if tables.command_prefixes.contains(&first) && trimmed.len() > 1 && !trimmed.chars().nth(1).unwrap().is_whitespace() {
            return Classification {
                primary: Kind::Command,
                confidence: 0.95,
                secondary: vec![],
                sentiment: sentiment_of(&normalized, tables),
            };
        }
    }

    let greeting_hits = count_matches(&normalized, &tables.greetings);
    let farewell_hits = count_matches(&normalized, &tables.farewells);
    let help_hits = count_matches(&normalized, &tables.help);
    let question_hits = count_matches(&normalized, &tables.question_markers);

    let mut secondary = Vec::new();
    let mut counts: Vec<(Kind, usize)> = Vec::new();
    if greeting_hits > 0 {
        secondary.push(Kind::Greeting);
        counts.push((Kind::Greeting, greeting_hits));
    }
    if farewell_hits > 0 {
        secondary.push(Kind::Farewell);
        counts.push((Kind::Farewell, farewell_hits));
    }
    if help_hits > 0 {
        secondary.push(Kind::Help);
        counts.push((Kind::Help, help_hits));
    }
    if question_hits > 0 {
        secondary.push(Kind::Question);
        counts.push((Kind::Question, question_hits));
    }

    if let Some(max_count) = counts.iter().map(|(_, c)| *c).max() {
        // Tie-break by fixed priority: greeting > farewell > help > question.
        let priority = [Kind::Greeting, Kind::Farewell, Kind::Help, Kind::Question];
        let primary = priority
            .into_iter()
            .find(|k| counts.iter().any(|(kind, c)| kind == k && *c == max_count))
            .expect("counts is non-empty so a max exists among the priority set");

        let matched: usize = counts.iter().map(|(_, c)| *c).sum();
        let confidence = (matched as f32 / token_count(trimmed) as f32).clamp(0.5, 0.95);

        return Classification { primary, confidence, secondary, sentiment: sentiment_of(&normalized, tables) };
    }

    let contextual_hits = count_matches(&normalized, &tables.contextual);
    if contextual_hits > 0 {
        let confidence = (contextual_hits as f32 / token_count(trimmed) as f32).clamp(0.5, 0.95);
        return Classification {
            primary: Kind::Contextual,
            confidence,
            secondary: vec![],
            sentiment: sentiment_of(&normalized, tables),
        };
    }

    Classification { primary: Kind::Unknown, confidence: 0.5, secondary: vec![], sentiment: sentiment_of(&normalized, tables) }
}

fn sentiment_of(normalized: &str, tables: &KeywordTables) -> Sentiment {
    let pos = count_matches(normalized, &tables.positive);
    let neg = count_matches(normalized, &tables.negative);
    match pos.cmp(&neg) {
        std::cmp::Ordering::Greater => Sentiment::Positive,
        std::cmp::Ordering::Less => Sentiment::Negative,
        std::cmp::Ordering::Equal => Sentiment::Neutral,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_prefix_wins() {
        let c = classify("!status", &KeywordTables::default());
        assert_eq!(c.primary, Kind::Command);
        assert_eq!(c.confidence, 0.95);
    }

    #[test]
    fn bare_prefix_is_not_a_command() {
        let c = classify("!", &KeywordTables::default());
        assert_ne!(c.primary, Kind::Command);
    }

    #[test]
    fn greeting_detected_case_and_diacritic_insensitive() {
        let c = classify("HOLA buenos días!", &KeywordTables::default());
        assert_eq!(c.primary, Kind::Greeting);
    }

    #[test]
    fn question_marker_detected() {
        let c = classify("donde estas?", &KeywordTables::default());
        assert_eq!(c.primary, Kind::Question);
    }

    #[test]
    fn priority_breaks_ties_greeting_over_question() {
        // "hola" (greeting) and "?" (question) both fire once each.
        let c = classify("hola?", &KeywordTables::default());
        assert_eq!(c.primary, Kind::Greeting);
        assert!(c.secondary.contains(&Kind::Question));
    }

    #[test]
    fn contextual_when_no_group_fires_but_keyword_present() {
        let c = classify("estoy tan aburrido hoy", &KeywordTables::default());
        assert_eq!(c.primary, Kind::Contextual);
    }

    #[test]
    fn unknown_when_nothing_matches() {
        let c = classify("xyzzy plugh", &KeywordTables::default());
        assert_eq!(c.primary, Kind::Unknown);
        assert_eq!(c.confidence, 0.5);
    }

    #[test]
    fn sentiment_positive_negative_tie_is_neutral() {
        let c = classify("esto es bien pero tambien mal", &KeywordTables::default());
        assert_eq!(c.sentiment, Sentiment::Neutral);
    }

    #[test]
    fn confidence_never_exceeds_point_nine_five_for_non_command() {
        let tables = KeywordTables::default();
        let c = classify("hola hola hola hola", &tables);
        assert!(c.confidence <= 0.95);
    }
}
