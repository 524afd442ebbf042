//! Frequency lexicon
//!
//! Maps the free-text frequency phrase on a problem record to a 1-10 signal.
//! Phrases are matched case-insensitively by substring and the longest match
//! wins, so "several times a day" lands in the hourly tier rather than daily
//! and "biweekly" is not read as "weekly".

const UNMATCHED: u8 = 4;

const LEXICON: &[(&str, u8)] = &[
  ("constantly", 10),
  ("all the time", 10),
  ("every time", 10),
  ("always", 10),
  ("hourly", 9),
  ("every hour", 9),
  ("several times a day", 9),
  ("multiple times a day", 9),
  ("many times a day", 9),
  ("daily", 8),
  ("every day", 8),
  ("each day", 8),
  ("a day", 8),
  ("every morning", 8),
  ("frequently", 7),
  ("often", 7),
  ("regularly", 7),
  ("several times a week", 7),
  ("weekly", 6),
  ("every week", 6),
  ("a week", 6),
  ("biweekly", 5),
  ("every other week", 5),
  ("every two weeks", 5),
  ("sometimes", 5),
  ("occasionally", 5),
  ("monthly", 4),
  ("every month", 4),
  ("a month", 4),
  ("bimonthly", 3),
  ("quarterly", 3),
  ("every quarter", 3),
  ("rarely", 2),
  ("yearly", 2),
  ("annually", 2),
  ("once", 1),
  ("one time", 1),
];

/// Signal for a frequency phrase; unmatched or empty phrases score 4
pub fn frequency_signal(phrase: &str) -> u8 {
  let phrase = phrase.trim().to_lowercase();
  if phrase.is_empty() {
    return UNMATCHED;
  }
  LEXICON
    .iter()
    .filter(|(needle, _)| phrase.contains(needle))
    .max_by_key(|(needle, _)| needle.len())
    .map(|(_, signal)| *signal)
    .unwrap_or(UNMATCHED)
}

/// Mean signal over a set of phrases; 0.0 for an empty set
pub fn average_signal<'a, I>(phrases: I) -> f64
where
  I: IntoIterator<Item = &'a str>,
{
  let (total, count) = phrases.into_iter().fold((0u64, 0u64), |(total, count), phrase| {
    (total + u64::from(frequency_signal(phrase)), count + 1)
  });
  if count == 0 {
    0.0
  } else {
    total as f64 / count as f64
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_known_phrases() {
    assert_eq!(frequency_signal("Constantly"), 10);
    assert_eq!(frequency_signal("several times a day"), 9);
    assert_eq!(frequency_signal("every day at standup"), 8);
    assert_eq!(frequency_signal("weekly"), 6);
    assert_eq!(frequency_signal("once per release"), 1);
  }

  #[test]
  fn test_compound_terms_beat_their_suffix() {
    assert_eq!(frequency_signal("biweekly"), 5);
    assert_eq!(frequency_signal("Biweekly sprint review"), 5);
    assert_eq!(frequency_signal("every other week"), 5);
    assert_eq!(frequency_signal("bimonthly"), 3);
    assert_eq!(frequency_signal("several times a week"), 7);
  }

  #[test]
  fn test_unmatched_defaults_to_four() {
    assert_eq!(frequency_signal(""), 4);
    assert_eq!(frequency_signal("whenever the moon is full"), 4);
  }

  #[test]
  fn test_average() {
    assert_eq!(average_signal(["daily", "weekly"]), 7.0);
    assert_eq!(average_signal(std::iter::empty()), 0.0);
  }
}
