//! Expression text to canonical rule list.
//!
//! Grammar, tokens case-insensitive:
//!
//! ```text
//! expression := integer | rule ("," rule)*
//! rule       := age ":" keep
//! age        := integer unit?              a bare number counts hours
//! keep       := "all" | "none" | integer ("/" integer? unit?)? | unit | word
//! unit       := "h" | "d" | "w" | "m" | "y"
//! word       := "hourly" | "daily" | "weekly" | "monthly" | "yearly"
//! ```

use thiserror::Error;

use crate::{Age, Interval, Keep, RetentionExpression, Rule};

/// Malformed retention expression, pointing at the offending token.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RetentionParseError {
    /// The expression is empty or all whitespace.
    #[error("empty retention expression")]
    Empty,
    /// A rule is not `<age>:<keep>` and not a bare count.
    #[error("rule `{token}` at offset {offset} must be `<age>:<keep>` or a bare count")]
    MalformedRule {
        /// The rule text as written.
        token: String,
        /// Byte offset of the token within the expression.
        offset: usize,
    },
    /// The age part of a rule did not parse.
    #[error("invalid age `{token}` at offset {offset}: expected `<n>[h|d|w|m|y]`")]
    InvalidAge {
        /// The age text as written.
        token: String,
        /// Byte offset of the token within the expression.
        offset: usize,
    },
    /// The keep part of a rule did not parse.
    #[error(
        "invalid keep `{token}` at offset {offset}: expected `all`, `none`, a count, or `<n>/<k><unit>`"
    )]
    InvalidKeep {
        /// The keep text as written.
        token: String,
        /// Byte offset of the token within the expression.
        offset: usize,
    },
    /// A count or multiplier of zero.
    #[error("`{token}` at offset {offset}: counts must be at least 1")]
    ZeroCount {
        /// The offending token.
        token: String,
        /// Byte offset of the token within the expression.
        offset: usize,
    },
    /// Two rules open a tier at the same age.
    #[error("duplicate tier age `{token}` at offset {offset}")]
    DuplicateAge {
        /// The age text of the later duplicate.
        token: String,
        /// Byte offset of the token within the expression.
        offset: usize,
    },
}

pub(crate) fn parse(text: &str) -> Result<RetentionExpression, RetentionParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(RetentionParseError::Empty);
    }

    // Degenerate form: one bare integer keeps the N most recent snapshots.
    if trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
        let count = parse_count(trimmed, offset_of(text, trimmed))?;
        return Ok(RetentionExpression::from_rules(vec![Rule {
            age: Age::ZERO,
            keep: Keep::Newest(count),
        }]));
    }

    let mut rules: Vec<(Rule, String, usize)> = Vec::new();
    let mut cursor = 0;
    for part in text.split(',') {
        let token = part.trim();
        let offset = cursor + offset_of(part, token);
        rules.push((parse_rule(token, offset)?, token.to_string(), offset));
        cursor += part.len() + 1;
    }

    rules.sort_by_key(|(rule, _, _)| rule.age.duration());
    for pair in rules.windows(2) {
        if pair[0].0.age.duration() == pair[1].0.age.duration() {
            return Err(RetentionParseError::DuplicateAge {
                token: pair[1].1.clone(),
                offset: pair[1].2,
            });
        }
    }

    Ok(RetentionExpression::from_rules(
        rules.into_iter().map(|(rule, _, _)| rule).collect(),
    ))
}

fn parse_rule(token: &str, offset: usize) -> Result<Rule, RetentionParseError> {
    let Some(colon) = token.find(':') else {
        return Err(RetentionParseError::MalformedRule {
            token: token.to_string(),
            offset,
        });
    };

    let age_part = &token[..colon];
    let keep_part = &token[colon + 1..];
    let age_text = age_part.trim();
    let keep_text = keep_part.trim();

    let age = parse_age(age_text, offset + offset_of(age_part, age_text))?;
    let keep = parse_keep(
        keep_text,
        offset + colon + 1 + offset_of(keep_part, keep_text),
    )?;
    Ok(Rule { age, keep })
}

fn parse_age(text: &str, offset: usize) -> Result<Age, RetentionParseError> {
    let digits: &str = &text[..text.bytes().take_while(u8::is_ascii_digit).count()];
    let rest = &text[digits.len()..];

    let invalid = || RetentionParseError::InvalidAge {
        token: text.to_string(),
        offset,
    };
    let amount: u32 = digits.parse().map_err(|_| invalid())?;

    let interval = match rest.chars().collect::<Vec<_>>().as_slice() {
        [] => Interval::Hour,
        [symbol] => Interval::from_symbol(*symbol).ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };

    Ok(Age { amount, interval })
}

fn parse_keep(text: &str, offset: usize) -> Result<Keep, RetentionParseError> {
    let invalid = || RetentionParseError::InvalidKeep {
        token: text.to_string(),
        offset,
    };

    match text.to_ascii_lowercase().as_str() {
        "" => return Err(invalid()),
        "all" => return Ok(Keep::All),
        "none" => return Ok(Keep::None),
        "hourly" => return Ok(per_interval(1, 1, Interval::Hour)),
        "daily" => return Ok(per_interval(1, 1, Interval::Day)),
        "weekly" => return Ok(per_interval(1, 1, Interval::Week)),
        "monthly" => return Ok(per_interval(1, 1, Interval::Month)),
        "yearly" => return Ok(per_interval(1, 1, Interval::Year)),
        _ => {}
    }

    // A lone unit letter is shorthand for one per interval.
    if text.len() == 1 {
        if let Some(interval) = text.chars().next().and_then(Interval::from_symbol) {
            return Ok(per_interval(1, 1, interval));
        }
    }

    let (count_text, spec) = match text.find('/') {
        Some(slash) => (&text[..slash], Some(&text[slash + 1..])),
        None => (text, None),
    };
    if count_text.is_empty() || !count_text.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(invalid());
    }
    let count = parse_count(count_text, offset)?;

    let Some(spec) = spec else {
        // Bare count: keep the N most recent snapshots of the tier.
        return Ok(Keep::Newest(count));
    };
    if spec.is_empty() {
        // Trailing slash, the canonical spelling of the bare-count form.
        return Ok(Keep::Newest(count));
    }

    let digits: &str = &spec[..spec.bytes().take_while(u8::is_ascii_digit).count()];
    let multiplier = if digits.is_empty() {
        1
    } else {
        parse_count(digits, offset)?
    };
    let interval = match spec[digits.len()..].chars().collect::<Vec<_>>().as_slice() {
        [symbol] => Interval::from_symbol(*symbol).ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };

    Ok(per_interval(count, multiplier, interval))
}

fn per_interval(count: u32, multiplier: u32, interval: Interval) -> Keep {
    Keep::PerInterval {
        count,
        multiplier,
        interval,
    }
}

fn parse_count(digits: &str, offset: usize) -> Result<u32, RetentionParseError> {
    let count: u32 = digits
        .parse()
        .map_err(|_| RetentionParseError::InvalidKeep {
            token: digits.to_string(),
            offset,
        })?;
    if count == 0 {
        return Err(RetentionParseError::ZeroCount {
            token: digits.to_string(),
            offset,
        });
    }
    Ok(count)
}

/// Byte offset of `token` (a trimmed subslice) within `part`.
fn offset_of(part: &str, token: &str) -> usize {
    (token.as_ptr() as usize).saturating_sub(part.as_ptr() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(text: &str) -> RetentionExpression {
        text.parse().expect("expression parses")
    }

    #[test]
    fn full_expression() {
        let expr = parse_ok("1d:4/d, 1w:1/d, 1m:1/w, 2m:none");
        let rules = expr.rules();
        assert_eq!(rules.len(), 4);
        assert_eq!(
            rules[0].keep,
            Keep::PerInterval {
                count: 4,
                multiplier: 1,
                interval: Interval::Day
            }
        );
        assert_eq!(rules[3].keep, Keep::None);
    }

    #[test]
    fn bare_age_counts_hours() {
        let expr = parse_ok("6:all");
        assert_eq!(
            expr.rules()[0].age,
            Age {
                amount: 6,
                interval: Interval::Hour
            }
        );
    }

    #[test]
    fn multiplier_spec() {
        let expr = parse_ok("1m:1/4m");
        assert_eq!(
            expr.rules()[0].keep,
            Keep::PerInterval {
                count: 1,
                multiplier: 4,
                interval: Interval::Month
            }
        );
    }

    #[test]
    fn lone_unit_letter_keeps_one_per_interval() {
        let expr = parse_ok("1w:d");
        assert_eq!(
            expr.rules()[0].keep,
            Keep::PerInterval {
                count: 1,
                multiplier: 1,
                interval: Interval::Day
            }
        );
    }

    #[test]
    fn trailing_slash_is_newest() {
        let expr = parse_ok("0h:3/");
        assert_eq!(expr.rules()[0].keep, Keep::Newest(3));
        assert_eq!(expr.as_plain_count(), Some(3));
    }

    #[test]
    fn static_count_within_rule() {
        let expr = parse_ok("1d:5");
        assert_eq!(expr.rules()[0].keep, Keep::Newest(5));
    }

    #[test]
    fn case_insensitive_tokens() {
        let expr = parse_ok("1D:4/D, 2M:NONE");
        assert_eq!(expr.to_string(), "1d:4/d, 2m:none");
    }

    #[test]
    fn empty_expression_rejected() {
        assert_eq!(
            "   ".parse::<RetentionExpression>(),
            Err(RetentionParseError::Empty)
        );
    }

    #[test]
    fn missing_colon_reports_token_and_offset() {
        let err = "1d:all, bogus".parse::<RetentionExpression>().unwrap_err();
        assert_eq!(
            err,
            RetentionParseError::MalformedRule {
                token: "bogus".to_string(),
                offset: 8,
            }
        );
    }

    #[test]
    fn invalid_age_unit_rejected() {
        let err = "1x:all".parse::<RetentionExpression>().unwrap_err();
        assert!(matches!(err, RetentionParseError::InvalidAge { ref token, offset: 0 } if token == "1x"));
    }

    #[test]
    fn invalid_keep_reports_offset_past_colon() {
        let err = "1d:sometimes".parse::<RetentionExpression>().unwrap_err();
        assert!(
            matches!(err, RetentionParseError::InvalidKeep { ref token, offset: 3 } if token == "sometimes")
        );
    }

    #[test]
    fn zero_count_rejected() {
        assert!(matches!(
            "0".parse::<RetentionExpression>().unwrap_err(),
            RetentionParseError::ZeroCount { .. }
        ));
        assert!(matches!(
            "1d:0/d".parse::<RetentionExpression>().unwrap_err(),
            RetentionParseError::ZeroCount { .. }
        ));
    }

    #[test]
    fn duplicate_ages_rejected() {
        let err = "1d:all, 24h:none".parse::<RetentionExpression>().unwrap_err();
        assert_eq!(
            err,
            RetentionParseError::DuplicateAge {
                token: "24h:none".to_string(),
                offset: 8,
            }
        );
    }

    #[test]
    fn whitespace_tolerated_around_rules() {
        let expr = parse_ok("  2d: 1/d ,   2w : 3/w  ");
        assert_eq!(expr.to_string(), "2d:1/d, 2w:3/w");
    }

    mod properties {
        use proptest::prelude::*;

        use crate::{Age, Interval, Keep, RetentionExpression, Rule};

        fn interval_strategy() -> impl Strategy<Value = Interval> {
            prop_oneof![
                Just(Interval::Hour),
                Just(Interval::Day),
                Just(Interval::Week),
                Just(Interval::Month),
                Just(Interval::Year),
            ]
        }

        fn keep_strategy() -> impl Strategy<Value = Keep> {
            prop_oneof![
                Just(Keep::All),
                Just(Keep::None),
                (1u32..1000).prop_map(Keep::Newest),
                ((1u32..100), (1u32..13), interval_strategy()).prop_map(
                    |(count, multiplier, interval)| Keep::PerInterval {
                        count,
                        multiplier,
                        interval,
                    }
                ),
            ]
        }

        fn rules_strategy() -> impl Strategy<Value = Vec<Rule>> {
            prop::collection::vec(
                ((0u32..1000), interval_strategy(), keep_strategy()),
                1..6,
            )
            .prop_map(|raw| {
                let mut rules: Vec<Rule> = raw
                    .into_iter()
                    .map(|(amount, interval, keep)| Rule {
                        // All zero ages are the same tier; pin the canonical
                        // spelling so the bare-count form prints faithfully.
                        age: if amount == 0 {
                            Age::ZERO
                        } else {
                            Age { amount, interval }
                        },
                        keep,
                    })
                    .collect();
                rules.sort_by_key(|rule| rule.age.duration());
                rules.dedup_by_key(|rule| rule.age.duration());
                rules
            })
        }

        proptest! {
            #[test]
            fn canonical_text_round_trips(rules in rules_strategy()) {
                let expr = RetentionExpression::from_rules(rules);
                let reparsed: RetentionExpression =
                    expr.to_string().parse().expect("canonical text parses");
                prop_assert_eq!(reparsed, expr);
            }
        }
    }
}
