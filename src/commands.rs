use std::sync::OnceLock;

use regex::Regex;

// Mention markup looks like "[id12345|Display Name]".
fn mention_pattern() -> &'static Regex {
    static MENTION: OnceLock<Regex> = OnceLock::new();
    MENTION.get_or_init(|| Regex::new(r"\[id\d+\|[^\]]*\]").expect("mention pattern is valid"))
}

/// Recognize a command in raw message text.
///
/// Strips mention markup, lowercases and whitespace-splits the text, drops
/// a single leading `/` or `!` from the first token, and returns the full
/// token list iff the first token is in `vocabulary`. Pure and total: no
/// I/O, no failure modes.
pub fn parse_command(text: &str, vocabulary: &[&str]) -> Option<Vec<String>> {
    let stripped = mention_pattern().replace_all(text, "");
    let mut tokens: Vec<String> = stripped
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let first = tokens.first_mut()?;
    if first.len() > 1 && (first.starts_with('/') || first.starts_with('!')) {
        first.remove(0);
    }

    if vocabulary.contains(&tokens[0].as_str()) {
        Some(tokens)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_mention_and_prefix_symbol() {
        assert_eq!(
            parse_command("[id777|Bot Name] /on forward", &["on", "off"]),
            Some(vec!["on".to_string(), "forward".to_string()])
        );
        assert_eq!(
            parse_command("[id777|Bot Name] !off forward", &["on", "off"]),
            Some(vec!["off".to_string(), "forward".to_string()])
        );
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(
            parse_command("   cmd    test   ", &["cmd"]),
            Some(vec!["cmd".to_string(), "test".to_string()])
        );
    }

    #[test]
    fn unknown_first_token_is_none() {
        assert_eq!(parse_command("cmd2 test", &["cmd"]), None);
    }

    #[test]
    fn normalizes_case() {
        assert_eq!(
            parse_command("ON forward", &["on"]),
            Some(vec!["on".to_string(), "forward".to_string()])
        );
        assert_eq!(
            parse_command("[id13515|Test] cMd2 TeST", &["cmd", "cmd2"]),
            Some(vec!["cmd2".to_string(), "test".to_string()])
        );
    }

    #[test]
    fn mention_with_noisy_display_name_is_stripped() {
        let text = r#"[id13515|Test test test and test_=#@$(%&!)#@%$)+;".,v] cmd test"#;
        assert_eq!(
            parse_command(text, &["cmd", "cmd2"]),
            Some(vec!["cmd".to_string(), "test".to_string()])
        );
    }

    #[test]
    fn empty_and_bare_symbol_are_none() {
        assert_eq!(parse_command("", &["cmd"]), None);
        assert_eq!(parse_command("[id1|Bot]   ", &["cmd"]), None);
        // a one-character token never loses its symbol
        assert_eq!(parse_command("/ cmd", &["cmd"]), None);
    }

    #[test]
    fn prefix_symbol_is_stripped_at_most_once() {
        assert_eq!(parse_command("//cmd test", &["cmd"]), None);
    }
}
