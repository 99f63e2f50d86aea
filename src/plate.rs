//! Plate text grammar.
//!
//! A grammar is a fixed-length sequence of character classes, written as a
//! string over `D` (digit) and `L` (letter), e.g. `DDLDDDDD`. OCR output is
//! cleaned, checked position by position against the grammar, and then
//! corrected: letters commonly misread at digit positions become digits and
//! vice versa. A string that fails the check is not a plate and is dropped.

use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_GRAMMAR: &str = "DDLDDDDD";

/// Characters stripped from OCR text before matching.
const SEPARATORS: [char; 4] = [' ', '.', '-', '_'];

/// Letter read where a digit belongs.
const LETTER_TO_DIGIT: [(char, char); 7] = [
    ('D', '0'),
    ('O', '0'),
    ('I', '1'),
    ('J', '3'),
    ('A', '4'),
    ('G', '6'),
    ('S', '5'),
];

/// Digit read where a letter belongs.
const DIGIT_TO_LETTER: [(char, char); 7] = [
    ('0', 'D'),
    ('1', 'I'),
    ('3', 'J'),
    ('4', 'A'),
    ('6', 'G'),
    ('5', 'S'),
    ('8', 'B'),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CharClass {
    Digit,
    Letter,
}

impl CharClass {
    fn symbol(self) -> char {
        match self {
            CharClass::Digit => 'D',
            CharClass::Letter => 'L',
        }
    }

    fn accepts(self, c: char) -> bool {
        match self {
            CharClass::Digit => c.is_ascii_digit() || lookup(&LETTER_TO_DIGIT, c).is_some(),
            CharClass::Letter => c.is_ascii_uppercase() || lookup(&DIGIT_TO_LETTER, c).is_some(),
        }
    }

    fn correct(self, c: char) -> char {
        match self {
            CharClass::Digit if !c.is_ascii_digit() => lookup(&LETTER_TO_DIGIT, c).unwrap_or(c),
            CharClass::Letter if !c.is_ascii_uppercase() => {
                lookup(&DIGIT_TO_LETTER, c).unwrap_or(c)
            }
            _ => c,
        }
    }
}

fn lookup(table: &[(char, char)], c: char) -> Option<char> {
    table
        .iter()
        .find_map(|&(from, to)| (from == c).then_some(to))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlateGrammar {
    classes: Vec<CharClass>,
}

impl PlateGrammar {
    pub fn new(classes: Vec<CharClass>) -> Result<Self> {
        if classes.is_empty() {
            return Err(anyhow!("plate grammar must not be empty"));
        }
        Ok(Self { classes })
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn classes(&self) -> &[CharClass] {
        &self.classes
    }

    /// Clean, check and correct `raw`. `None` when it is not a plate.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let cleaned = clean_text(raw);
        let chars: Vec<char> = cleaned.chars().collect();
        if chars.len() != self.classes.len() {
            return None;
        }
        if !self
            .classes
            .iter()
            .zip(&chars)
            .all(|(class, &c)| class.accepts(c))
        {
            return None;
        }
        Some(
            self.classes
                .iter()
                .zip(chars)
                .map(|(class, c)| class.correct(c))
                .collect(),
        )
    }
}

impl Default for PlateGrammar {
    fn default() -> Self {
        Self {
            classes: vec![
                CharClass::Digit,
                CharClass::Digit,
                CharClass::Letter,
                CharClass::Digit,
                CharClass::Digit,
                CharClass::Digit,
                CharClass::Digit,
                CharClass::Digit,
            ],
        }
    }
}

impl FromStr for PlateGrammar {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let classes = s
            .trim()
            .chars()
            .map(|c| match c.to_ascii_uppercase() {
                'D' => Ok(CharClass::Digit),
                'L' => Ok(CharClass::Letter),
                other => Err(anyhow!(
                    "invalid plate grammar '{}': '{}' is not D or L",
                    s,
                    other
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(classes)
    }
}

impl fmt::Display for PlateGrammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for class in &self.classes {
            write!(f, "{}", class.symbol())?;
        }
        Ok(())
    }
}

/// Upper-case and strip separators.
pub fn clean_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| !SEPARATORS.contains(c))
        .flat_map(char::to_uppercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grammar_round_trips_as_text() {
        assert_eq!(PlateGrammar::default().to_string(), DEFAULT_GRAMMAR);
        assert_eq!(
            DEFAULT_GRAMMAR.parse::<PlateGrammar>().unwrap(),
            PlateGrammar::default()
        );
    }

    #[test]
    fn rejects_bad_grammar_strings() {
        assert!("".parse::<PlateGrammar>().is_err());
        assert!("DDXD".parse::<PlateGrammar>().is_err());
    }

    #[test]
    fn letter_o_at_letter_position_is_kept() {
        let grammar = PlateGrammar::default();
        assert_eq!(grammar.normalize("12O34567").as_deref(), Some("12O34567"));
    }

    #[test]
    fn corrects_confusables_by_position() {
        let grammar = PlateGrammar::default();
        // Digit positions: S->5, O->0, I->1. Letter position: 8->B.
        assert_eq!(grammar.normalize("S28O45I7").as_deref(), Some("52B04517"));
        assert_eq!(grammar.normalize("120345G7").as_deref(), Some("12D34567"));
    }

    #[test]
    fn cleans_separators_and_case() {
        let grammar = PlateGrammar::default();
        assert_eq!(grammar.normalize(" 12-a.345_67 ").as_deref(), Some("12A34567"));
    }

    #[test]
    fn rejects_wrong_length_or_unmappable_characters() {
        let grammar = PlateGrammar::default();
        assert_eq!(grammar.normalize("12A3456"), None);
        assert_eq!(grammar.normalize("12A345678"), None);
        // 'X' has no digit reading; '2' has no letter reading.
        assert_eq!(grammar.normalize("X2A34567"), None);
        assert_eq!(grammar.normalize("12234567"), None);
    }

    #[test]
    fn accepted_plates_match_their_grammar() {
        let grammar: PlateGrammar = "LLDDDDL".parse().unwrap();
        let inputs = ["AB1234C", "A81234C", "4BI2345", "ab 12 34 c", "0O1234S", "AB12340"];
        for input in inputs {
            if let Some(plate) = grammar.normalize(input) {
                assert_eq!(plate.chars().count(), grammar.len());
                for (class, c) in grammar.classes().iter().zip(plate.chars()) {
                    match class {
                        CharClass::Digit => assert!(c.is_ascii_digit(), "{plate}"),
                        CharClass::Letter => assert!(c.is_ascii_uppercase(), "{plate}"),
                    }
                }
            }
        }
        assert_eq!(grammar.normalize("A81234C").as_deref(), Some("AB1234C"));
        assert_eq!(grammar.normalize("AB12340").as_deref(), Some("AB1234D"));
    }
}
