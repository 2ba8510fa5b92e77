use crate::layers::{ResultSet, ScoredPaper};

/// Order scored papers best-first and cut the list down to `budget`.
///
/// Equal scores go to the more recent submission. `scored` should arrive in
/// source order: the sort is stable, so papers without a date keep it.
/// Papers below `min_score` are dropped before truncation.
pub fn assemble(mut scored: Vec<ScoredPaper>, budget: usize, min_score: u8) -> ResultSet {
    scored.retain(|p| p.relevancy_score >= min_score);
    scored.sort_by(|a, b| {
        b.relevancy_score
            .cmp(&a.relevancy_score)
            .then_with(|| b.paper.published.cmp(&a.paper.published))
    });
    scored.truncate(budget);
    scored
}
