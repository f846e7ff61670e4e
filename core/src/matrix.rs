/// Triangular relay-pair indexing shared by the stats, optimizer and selector
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Cost value for a pair with no usable link
pub const UNROUTABLE: i32 = -1;

/// Number of unordered pairs for `n` relays
pub fn tri_len(n: usize) -> usize {
    if n < 2 {
        0
    } else {
        n * (n - 1) / 2
    }
}

/// Index of the unordered pair `(i, j)`, `i != j`
pub fn tri_index(i: usize, j: usize) -> usize {
    debug_assert!(i != j, "no triangular entry for a relay paired with itself");
    let (a, b) = if i > j { (i, j) } else { (j, i) };
    a * (a + 1) / 2 - a + b
}

/// Undirected pairwise costs for one ordered relay-id list.
///
/// `costs[tri_index(i, j)]` is the cost in ms between `relay_ids[i]` and
/// `relay_ids[j]`, or [`UNROUTABLE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostMatrix {
    pub relay_ids: Vec<u64>,
    pub costs: Vec<i32>,
}

impl CostMatrix {
    /// All pairs unroutable
    pub fn new(relay_ids: Vec<u64>) -> Self {
        let costs = vec![UNROUTABLE; tri_len(relay_ids.len())];
        Self { relay_ids, costs }
    }

    pub fn num_relays(&self) -> usize {
        self.relay_ids.len()
    }

    pub fn get(&self, i: usize, j: usize) -> i32 {
        self.costs[tri_index(i, j)]
    }

    pub fn set(&mut self, i: usize, j: usize, cost: i32) {
        let index = tri_index(i, j);
        self.costs[index] = cost;
    }

    /// Pairs with a usable link
    pub fn routable_pairs(&self) -> usize {
        self.costs.iter().filter(|c| **c >= 0).count()
    }

    /// Check the cost table shape and values of a matrix from outside the aggregator
    pub fn validate(&self) -> Result<()> {
        let expected = tri_len(self.num_relays());
        if self.costs.len() != expected {
            return Err(CoreError::Config(format!(
                "{} relays need {} costs, found {}",
                self.num_relays(),
                expected,
                self.costs.len()
            )));
        }
        if let Some(index) = self.costs.iter().position(|c| *c < UNROUTABLE) {
            return Err(CoreError::Config(format!(
                "cost {} at index {} is below {}",
                self.costs[index], index, UNROUTABLE
            )));
        }
        Ok(())
    }
}
