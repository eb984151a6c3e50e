use super::{Score, Scorer};
use crate::dataset::Sample;
use crate::BenchResult;
use async_trait::async_trait;
use serde_json::Value;

/// A rectangular grid of integers.
pub type Grid = Vec<Vec<i64>>;

/// Grid-puzzle match, thresholded to 1 only when every cell agrees.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridScorer;

impl GridScorer {
    pub const NAME: &'static str = "grid_match";
}

/// Parse the first 2-D integer grid in `text`.
///
/// Returns `None` for empty or non-rectangular grids.
pub fn parse_grid(text: &str) -> Option<Grid> {
    let start = text.find("[[")?;
    let end = start + closing_bracket(&text[start..])? + 1;
    let value: Value = serde_json::from_str(&text[start..end]).ok()?;
    let rows = value.as_array()?;
    let mut grid = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = row
            .as_array()?
            .iter()
            .map(Value::as_i64)
            .collect::<Option<Vec<i64>>>()?;
        grid.push(cells);
    }
    let width = grid.first()?.len();
    if width == 0 || grid.iter().any(|row| row.len() != width) {
        return None;
    }
    Some(grid)
}

/// Byte offset of the bracket closing the one `text` starts with.
fn closing_bracket(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Fraction of matching cells over the overlapping region of two grids.
pub fn percentage_match(a: &str, b: &str) -> f64 {
    let (Some(a), Some(b)) = (parse_grid(a), parse_grid(b)) else {
        return 0.0;
    };
    let rows = a.len().min(b.len());
    let cols = a[0].len().min(b[0].len());
    let total = rows * cols;
    if total == 0 {
        return 0.0;
    }
    let matching = (0..rows)
        .flat_map(|r| (0..cols).map(move |c| (r, c)))
        .filter(|&(r, c)| a[r][c] == b[r][c])
        .count();
    matching as f64 / total as f64
}

#[async_trait]
impl Scorer for GridScorer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn score(&self, sample: &Sample, output: &str) -> BenchResult<Score> {
        let fraction = percentage_match(&sample.target, output);
        let same_shape = match (parse_grid(&sample.target), parse_grid(output)) {
            (Some(t), Some(o)) => t.len() == o.len() && t[0].len() == o[0].len(),
            _ => false,
        };
        let value = if same_shape && fraction >= 1.0 { 1.0 } else { 0.0 };
        Ok(Score::new(Self::NAME, value).explained(format!("{:.1}% of cells match", fraction * 100.0)))
    }
}
