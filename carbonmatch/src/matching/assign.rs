//! Optimal 1:1 assignment over a distance matrix.
//!
//! This is the combinatorial core of the matching engine: a minimum-cost
//! bipartite assignment solved with shortest augmenting paths and dual
//! potentials (Jonker-Volgenant style Hungarian). It is a pure function
//! over the distance matrix; exact-match stratum boundaries are enforced
//! by the caller solving one instance per stratum.
//!
//! Every treatment pixel receives at most one control and every control at
//! most one treatment. With `rows <= cols` and finite costs, all rows are
//! assigned; callers with more treatments than controls transpose first.

/// Minimum-total-cost assignment of each row to a distinct column.
///
/// `cost` must be rectangular with `rows <= cols`. Returns, per row, the
/// assigned column index. Total assigned cost is minimal over all
/// one-to-one assignments.
///
/// # Panics
///
/// Panics if the matrix is empty, ragged, or has more rows than columns.
pub fn assign(cost: &[Vec<f64>]) -> Vec<usize> {
    let n = cost.len();
    assert!(n > 0, "empty cost matrix");
    let m = cost[0].len();
    assert!(
        cost.iter().all(|r| r.len() == m),
        "ragged cost matrix"
    );
    assert!(n <= m, "assignment requires rows <= cols");

    // 1-indexed duals and matching, the classic formulation.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    let mut matched_row = vec![0usize; m + 1]; // matched_row[j] = row using col j
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        matched_row[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[j0] = true;
            let i0 = matched_row[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;

            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }

            for j in 0..=m {
                if used[j] {
                    u[matched_row[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }

            j0 = j1;
            if matched_row[j0] == 0 {
                break;
            }
        }

        // Augment along the found path.
        loop {
            let j1 = way[j0];
            matched_row[j0] = matched_row[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut result = vec![0usize; n];
    for j in 1..=m {
        if matched_row[j] > 0 {
            result[matched_row[j] - 1] = j - 1;
        }
    }
    result
}

/// Total cost of an assignment, for diagnostics and tests.
pub fn assignment_cost(cost: &[Vec<f64>], cols: &[usize]) -> f64 {
    cols.iter()
        .enumerate()
        .map(|(i, &j)| cost[i][j])
        .sum()
}
