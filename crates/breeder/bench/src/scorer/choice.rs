use super::{Score, Scorer};
use crate::dataset::Sample;
use crate::BenchResult;
use async_trait::async_trait;

/// Exact multiple-choice letter match.
///
/// Case-insensitive. The first four characters of the output may contain the
/// target letter only if no other letter appears there, so `"(C)"` matches
/// `C` but `"(B) incorrect"` and `"Cat"` do not.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiChoiceScorer;

impl MultiChoiceScorer {
    pub const NAME: &'static str = "multi_choice_match";

    pub fn matches(target: &str, output: &str) -> bool {
        let Some(letter) = target
            .trim()
            .chars()
            .find(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_uppercase())
        else {
            return false;
        };
        let mut seen_target = false;
        for c in output.trim().chars().take(4) {
            if !c.is_alphabetic() {
                continue;
            }
            if c.to_ascii_uppercase() == letter {
                seen_target = true;
            } else {
                return false;
            }
        }
        seen_target
    }
}

#[async_trait]
impl Scorer for MultiChoiceScorer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn score(&self, sample: &Sample, output: &str) -> BenchResult<Score> {
        let value = if Self::matches(&sample.target, output) {
            1.0
        } else {
            0.0
        };
        Ok(Score::new(Self::NAME, value))
    }
}
