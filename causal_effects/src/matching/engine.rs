use crate::propensity::PropensityScores;
use crate::table::{CovariateTable, UnitId};
use crate::CausalError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Score scale used for the matching distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchScale {
    #[default]
    Logit,
    Probability,
}

/// One treated unit bound to one control unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedPair {
    /// Row of the treated unit in the matched table.
    pub treated: usize,
    /// Row of the control unit in the matched table.
    pub control: usize,
    pub treated_id: UnitId,
    pub control_id: UnitId,
    /// Absolute score distance on the matching scale.
    pub distance: f64,
}

/// The output of a matching pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedSample {
    pub scale: MatchScale,
    pub pairs: Vec<MatchedPair>,
    /// Treated rows left without a control once the pool ran out.
    pub unmatched_treated: Vec<usize>,
    /// Treated and matched control rows, ascending.
    pub rows: Vec<usize>,
}

impl MatchedSample {
    /// `y_treated - y_control` per pair, in pair order.
    pub fn pair_differences(&self, table: &CovariateTable) -> Vec<f64> {
        let y = table.outcome();
        self.pairs
            .iter()
            .map(|p| y[p.treated] - y[p.control])
            .collect()
    }

    pub fn unmatched_count(&self) -> usize {
        self.unmatched_treated.len()
    }
}

/// Greedy 1:1 nearest-neighbour matcher on the propensity score, without
/// replacement.
///
/// Treated units are processed in ascending identifier order (the table's
/// row order) and each takes the closest control not yet consumed; equal
/// distances go to the lowest control identifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchingEngine {
    scale: MatchScale,
}

impl MatchingEngine {
    pub fn new(scale: MatchScale) -> Self {
        Self { scale }
    }

    pub fn match_units(
        &self,
        table: &CovariateTable,
        scores: &PropensityScores,
    ) -> Result<MatchedSample, CausalError> {
        if scores.len() != table.len() {
            return Err(CausalError::InvalidInput(format!(
                "{} scores for {} units",
                scores.len(),
                table.len()
            )));
        }
        let score = match self.scale {
            MatchScale::Logit => &scores.logit,
            MatchScale::Probability => &scores.probability,
        };
        let treated = table.treated();

        // Controls ordered by (score, row); rows ascend within equal scores.
        let mut controls = table.control_rows();
        controls.sort_by(|&a, &b| score[a].total_cmp(&score[b]).then(a.cmp(&b)));
        let control_scores: Vec<f64> = controls.iter().map(|&r| score[r]).collect();
        let mut pool = ControlPool::new(controls.len());

        let mut pairs = Vec::new();
        let mut unmatched_treated = Vec::new();
        for t in (0..table.len()).filter(|&i| treated[i]) {
            let s = score[t];
            let split = control_scores.partition_point(|&c| c < s);

            let right = pool.next_at_or_after(split);
            let mut left = split.checked_sub(1).and_then(|i| pool.prev_at_or_before(i));
            // Walk to the lowest row among equally scored controls on the left.
            while let Some(l) = left {
                match l.checked_sub(1).and_then(|i| pool.prev_at_or_before(i)) {
                    Some(prev) if control_scores[prev] == control_scores[l] => left = Some(prev),
                    _ => break,
                }
            }

            let chosen = match (left, right) {
                (None, None) => None,
                (Some(l), None) => Some(l),
                (None, Some(r)) => Some(r),
                (Some(l), Some(r)) => {
                    let dl = s - control_scores[l];
                    let dr = control_scores[r] - s;
                    if dl < dr || (dl == dr && controls[l] < controls[r]) {
                        Some(l)
                    } else {
                        Some(r)
                    }
                }
            };

            match chosen {
                Some(idx) => {
                    pool.consume(idx);
                    let c = controls[idx];
                    pairs.push(MatchedPair {
                        treated: t,
                        control: c,
                        treated_id: table.ids()[t].clone(),
                        control_id: table.ids()[c].clone(),
                        distance: (s - score[c]).abs(),
                    });
                }
                None => unmatched_treated.push(t),
            }
        }

        if !unmatched_treated.is_empty() {
            warn!(
                count = unmatched_treated.len(),
                "control pool exhausted before all treated units were matched"
            );
        }
        let mut rows: Vec<usize> = pairs.iter().flat_map(|p| [p.treated, p.control]).collect();
        rows.sort_unstable();
        info!(pairs = pairs.len(), "matching complete");

        Ok(MatchedSample {
            scale: self.scale,
            pairs,
            unmatched_treated,
            rows,
        })
    }
}

/// Sorted control slots with O(α(n)) lookup of the nearest unconsumed slot
/// on either side.
struct ControlPool {
    // next[i]: candidate for the first free slot >= i; len() is the sentinel.
    next: Vec<usize>,
    // prev[i + 1]: candidate for the last free slot <= i; 0 is the sentinel.
    prev: Vec<usize>,
}

impl ControlPool {
    fn new(n: usize) -> Self {
        Self {
            next: (0..=n).collect(),
            prev: (0..=n).collect(),
        }
    }

    fn next_at_or_after(&mut self, i: usize) -> Option<usize> {
        let n = self.next.len() - 1;
        let found = find(&mut self.next, i);
        (found < n).then_some(found)
    }

    fn prev_at_or_before(&mut self, i: usize) -> Option<usize> {
        let found = find(&mut self.prev, i + 1);
        found.checked_sub(1)
    }

    fn consume(&mut self, i: usize) {
        self.next[i] = i + 1;
        self.prev[i + 1] = i;
    }
}

fn find(parent: &mut [usize], i: usize) -> usize {
    let mut root = i;
    while parent[root] != root {
        root = parent[root];
    }
    let mut cur = i;
    while parent[cur] != root {
        let up = parent[cur];
        parent[cur] = root;
        cur = up;
    }
    root
}
