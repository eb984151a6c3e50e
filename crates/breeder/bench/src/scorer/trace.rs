use super::{Score, Scorer};
use crate::dataset::Sample;
use crate::BenchResult;
use async_trait::async_trait;
use serde_json::Value;

/// Algorithm-trace match.
///
/// An exact trace scores 1. Otherwise an answer whose last element equals the
/// target's last element and which is an ordered subsequence of the target
/// earns `len(answer) / len(target)`. Anything else scores 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceScorer;

impl TraceScorer {
    pub const NAME: &'static str = "trace_match";
}

fn parse_trace(text: &str) -> Option<Vec<Value>> {
    let text = text.trim();
    let parsed = serde_json::from_str::<Value>(text)
        .or_else(|_| serde_json::from_str::<Value>(&text.replace('\'', "\"")))
        .ok()?;
    match parsed {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

fn is_subsequence(short: &[Value], long: &[Value]) -> bool {
    let mut rest = long.iter();
    short.iter().all(|item| rest.any(|candidate| candidate == item))
}

/// Trace score of `answer` against `target`.
pub fn trace_score(target: &str, answer: &str) -> f64 {
    let (Some(target), Some(answer)) = (parse_trace(target), parse_trace(answer)) else {
        return 0.0;
    };
    if target.is_empty() || answer.is_empty() {
        return 0.0;
    }
    if answer == target {
        return 1.0;
    }
    if answer.len() > target.len() || answer.last() != target.last() {
        return 0.0;
    }
    if is_subsequence(&answer, &target) {
        answer.len() as f64 / target.len() as f64
    } else {
        0.0
    }
}

#[async_trait]
impl Scorer for TraceScorer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn score(&self, sample: &Sample, output: &str) -> BenchResult<Score> {
        Ok(Score::new(Self::NAME, trace_score(&sample.target, output)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_trace_scores_one() {
        assert_eq!(trace_score("[[1,2],[2,1]]", "[[1,2],[2,1]]"), 1.0);
        assert_eq!(trace_score("[[1,2],[2,1]]", "[[1, 2], [2, 1]]"), 1.0);
    }

    #[test]
    fn final_element_with_subsequence_scores_ratio() {
        assert_eq!(trace_score("[[1,2],[2,1]]", "[[2,1]]"), 0.5);
        assert_eq!(trace_score("[1,2,3,4]", "[1,3,4]"), 0.75);
    }

    #[test]
    fn wrong_final_or_order_scores_zero() {
        assert_eq!(trace_score("[[1,2],[2,1]]", "[[1,2]]"), 0.0);
        assert_eq!(trace_score("[1,2,3,4]", "[3,1,4]"), 0.0);
        assert_eq!(trace_score("[1,2,3]", "[1,2,3,3]"), 0.0);
        assert_eq!(trace_score("[1,2,3]", ""), 0.0);
        assert_eq!(trace_score("[1,2,3]", "not a trace"), 0.0);
    }

    #[test]
    fn python_quoted_lists_parse() {
        assert_eq!(trace_score(r#"["a","b"]"#, "['a', 'b']"), 1.0);
    }
}
