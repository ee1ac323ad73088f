//! Command tokenizer
//!
//! Splits a G-code line into words. An uppercase letter starts a new word,
//! lowercase letters, digits, `.` and `-` extend the current word, a space
//! ends it, and every other character is dropped.

/// Tokenize one line into its words
pub fn tokenize_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in line.chars() {
        match ch {
            'A'..='Z' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                current.push(ch);
            }
            'a'..='z' | '0'..='9' | '.' | '-' => current.push(ch),
            ' ' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => {}
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_words_split_on_uppercase() {
        assert_eq!(tokenize_line("G1X10Y-2.5E0.3"), vec!["G1", "X10", "Y-2.5", "E0.3"]);
    }

    #[test]
    fn test_spaces_and_symbols() {
        assert_eq!(tokenize_line("G0 X1  Y2 ;move"), vec!["G0", "X1", "Y2", "move"]);
        assert_eq!(tokenize_line("M117 Start"), vec!["M117", "Start"]);
        assert_eq!(tokenize_line("*pos-push"), vec!["pos-push"]);
    }

    #[test]
    fn test_empty() {
        assert!(tokenize_line("").is_empty());
        assert!(tokenize_line("  ;;  ").is_empty());
    }
}
