//! CART decision tree shared by both ensembles.
//!
//! Classification trees minimise Gini impurity and store class fractions in
//! their leaves; regression trees minimise squared error and store a single
//! value. Samples go left when `x[feature] <= threshold`.

use anyhow::{Result, bail};
use bincode::{Decode, Encode};
use ndarray::{ArrayView1, ArrayView2};
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct Split {
    pub feature: usize,
    pub threshold: f64,
    pub left: usize,
    pub right: usize,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Node {
    pub split: Option<Split>,
    /// Class fractions (classification) or `[prediction]` (regression).
    pub value: Vec<f64>,
    pub n_samples: usize,
    pub impurity: f64,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.split.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features examined per split; `None` means all.
    pub max_features: Option<usize>,
}

impl TreeParams {
    pub fn with_depth(max_depth: usize) -> Self {
        Self {
            max_depth,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct DecisionTree {
    pub nodes: Vec<Node>,
    pub n_features: usize,
    /// Unnormalised weighted impurity decrease per feature.
    pub importances: Vec<f64>,
}

/// Running sufficient statistics for a set of samples.
trait SplitStats: Clone {
    fn cleared(&self) -> Self;
    fn add(&mut self, sample: usize);
    fn remove(&mut self, sample: usize);
    fn count(&self) -> usize;
    fn impurity(&self) -> f64;
    fn leaf_value(&self) -> Vec<f64>;
}

#[derive(Clone)]
struct GiniStats<'a> {
    y: &'a [usize],
    counts: Vec<f64>,
    n: usize,
}

impl SplitStats for GiniStats<'_> {
    fn cleared(&self) -> Self {
        Self {
            y: self.y,
            counts: vec![0.0; self.counts.len()],
            n: 0,
        }
    }

    fn add(&mut self, sample: usize) {
        self.counts[self.y[sample]] += 1.0;
        self.n += 1;
    }

    fn remove(&mut self, sample: usize) {
        self.counts[self.y[sample]] -= 1.0;
        self.n -= 1;
    }

    fn count(&self) -> usize {
        self.n
    }

    fn impurity(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let n = self.n as f64;
        1.0 - self.counts.iter().map(|c| (c / n) * (c / n)).sum::<f64>()
    }

    fn leaf_value(&self) -> Vec<f64> {
        let n = self.n.max(1) as f64;
        self.counts.iter().map(|c| c / n).collect()
    }
}

#[derive(Clone)]
struct MseStats<'a> {
    y: &'a [f64],
    sum: f64,
    sum_sq: f64,
    n: usize,
}

impl SplitStats for MseStats<'_> {
    fn cleared(&self) -> Self {
        Self {
            y: self.y,
            sum: 0.0,
            sum_sq: 0.0,
            n: 0,
        }
    }

    fn add(&mut self, sample: usize) {
        let v = self.y[sample];
        self.sum += v;
        self.sum_sq += v * v;
        self.n += 1;
    }

    fn remove(&mut self, sample: usize) {
        let v = self.y[sample];
        self.sum -= v;
        self.sum_sq -= v * v;
        self.n -= 1;
    }

    fn count(&self) -> usize {
        self.n
    }

    fn impurity(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let n = self.n as f64;
        let mean = self.sum / n;
        (self.sum_sq / n - mean * mean).max(0.0)
    }

    fn leaf_value(&self) -> Vec<f64> {
        vec![self.sum / self.n.max(1) as f64]
    }
}

struct Candidate {
    feature: usize,
    threshold: f64,
    /// `n_left * imp_left + n_right * imp_right`
    weighted_impurity: f64,
}

struct Builder<'x, 'p, 'r, S> {
    x: ArrayView2<'x, f64>,
    params: &'p TreeParams,
    proto: S,
    rng: &'r mut ChaCha8Rng,
    nodes: Vec<Node>,
    importances: Vec<f64>,
}

impl<S: SplitStats> Builder<'_, '_, '_, S> {
    fn stats_for(&self, idx: &[usize]) -> S {
        let mut stats = self.proto.cleared();
        for &i in idx {
            stats.add(i);
        }
        stats
    }

    fn candidate_features(&mut self) -> Vec<usize> {
        let n_features = self.x.ncols();
        match self.params.max_features {
            Some(k) if k < n_features => sample(&mut *self.rng, n_features, k.max(1)).into_vec(),
            _ => (0..n_features).collect(),
        }
    }

    fn best_split(&mut self, idx: &mut [usize], parent: &S) -> Option<Candidate> {
        let n = idx.len();
        let min_leaf = self.params.min_samples_leaf.max(1);
        let mut best: Option<Candidate> = None;

        for feature in self.candidate_features() {
            let x = self.x;
            idx.sort_by(|a, b| x[[*a, feature]].total_cmp(&x[[*b, feature]]));

            let mut left = parent.cleared();
            let mut right = parent.clone();
            for pos in 0..n - 1 {
                left.add(idx[pos]);
                right.remove(idx[pos]);

                let here = x[[idx[pos], feature]];
                let next = x[[idx[pos + 1], feature]];
                if next <= here {
                    continue;
                }
                if left.count() < min_leaf || right.count() < min_leaf {
                    continue;
                }

                let weighted = left.count() as f64 * left.impurity()
                    + right.count() as f64 * right.impurity();
                if best
                    .as_ref()
                    .is_none_or(|b| weighted < b.weighted_impurity)
                {
                    let mut threshold = here + (next - here) / 2.0;
                    if threshold >= next || !threshold.is_finite() {
                        threshold = here;
                    }
                    best = Some(Candidate {
                        feature,
                        threshold,
                        weighted_impurity: weighted,
                    });
                }
            }
        }
        best
    }

    fn build(&mut self, idx: &mut [usize], depth: usize) -> usize {
        let stats = self.stats_for(idx);
        let impurity = stats.impurity();
        let node_id = self.nodes.len();
        self.nodes.push(Node {
            split: None,
            value: stats.leaf_value(),
            n_samples: idx.len(),
            impurity,
        });

        let n = idx.len();
        if depth >= self.params.max_depth
            || n < self.params.min_samples_split.max(2)
            || n < 2 * self.params.min_samples_leaf.max(1)
            || impurity <= 1e-12
        {
            return node_id;
        }

        let Some(best) = self.best_split(idx, &stats) else {
            return node_id;
        };
        let parent_weighted = n as f64 * impurity;
        if best.weighted_impurity >= parent_weighted - 1e-12 {
            return node_id;
        }
        self.importances[best.feature] += parent_weighted - best.weighted_impurity;

        let x = self.x;
        let feature = best.feature;
        idx.sort_by(|a, b| x[[*a, feature]].total_cmp(&x[[*b, feature]]));
        let cut = idx.partition_point(|&i| x[[i, feature]] <= best.threshold);
        let (left_idx, right_idx) = idx.split_at_mut(cut);

        let left = self.build(left_idx, depth + 1);
        let right = self.build(right_idx, depth + 1);
        self.nodes[node_id].split = Some(Split {
            feature,
            threshold: best.threshold,
            left,
            right,
        });
        node_id
    }
}

fn check_inputs(x: ArrayView2<f64>, targets: usize, samples: &[usize]) -> Result<()> {
    if x.nrows() != targets {
        bail!("{} rows but {} targets", x.nrows(), targets);
    }
    if samples.is_empty() {
        bail!("cannot fit a tree on zero samples");
    }
    if let Some(&bad) = samples.iter().find(|&&i| i >= x.nrows()) {
        bail!("sample index {bad} out of range");
    }
    Ok(())
}

impl DecisionTree {
    fn from_builder<S>(builder: Builder<'_, '_, '_, S>, n_features: usize) -> Self {
        Self {
            nodes: builder.nodes,
            n_features,
            importances: builder.importances,
        }
    }

    /// Fit a Gini classification tree on `samples` (duplicates allowed, as in a bootstrap).
    pub fn fit_classifier(
        x: ArrayView2<f64>,
        y: &[usize],
        n_classes: usize,
        samples: &[usize],
        params: &TreeParams,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self> {
        check_inputs(x, y.len(), samples)?;
        if let Some(&bad) = y.iter().find(|&&c| c >= n_classes) {
            bail!("class index {bad} out of range for {n_classes} classes");
        }
        let mut idx = samples.to_vec();
        let mut builder = Builder {
            x,
            params,
            proto: GiniStats {
                y,
                counts: vec![0.0; n_classes],
                n: 0,
            },
            rng,
            nodes: Vec::new(),
            importances: vec![0.0; x.ncols()],
        };
        builder.build(&mut idx, 0);
        Ok(Self::from_builder(builder, x.ncols()))
    }

    /// Fit a squared-error regression tree.
    pub fn fit_regressor(
        x: ArrayView2<f64>,
        y: &[f64],
        samples: &[usize],
        params: &TreeParams,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self> {
        check_inputs(x, y.len(), samples)?;
        let mut idx = samples.to_vec();
        let mut builder = Builder {
            x,
            params,
            proto: MseStats {
                y,
                sum: 0.0,
                sum_sq: 0.0,
                n: 0,
            },
            rng,
            nodes: Vec::new(),
            importances: vec![0.0; x.ncols()],
        };
        builder.build(&mut idx, 0);
        Ok(Self::from_builder(builder, x.ncols()))
    }

    /// Index of the leaf `row` lands in.
    pub fn apply(&self, row: ArrayView1<f64>) -> usize {
        let mut id = 0;
        while let Some(split) = self.nodes[id].split {
            id = if row[split.feature] <= split.threshold {
                split.left
            } else {
                split.right
            };
        }
        id
    }

    pub fn leaf_value(&self, row: ArrayView1<f64>) -> &[f64] {
        &self.nodes[self.apply(row)].value
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], id: usize) -> usize {
            match nodes[id].split {
                Some(s) => 1 + walk(nodes, s.left).max(walk(nodes, s.right)),
                None => 0,
            }
        }
        if self.nodes.is_empty() { 0 } else { walk(&self.nodes, 0) }
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// Check the invariants `apply` relies on: children come after their
    /// parent, split features are in range and every leaf holds
    /// `value_width` entries.
    pub fn validate(&self, value_width: usize) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("tree has no nodes");
        }
        for (id, node) in self.nodes.iter().enumerate() {
            match node.split {
                Some(split) => {
                    for child in [split.left, split.right] {
                        if child <= id || child >= self.nodes.len() {
                            bail!("node {id} points to invalid child {child}");
                        }
                    }
                    if split.feature >= self.n_features {
                        bail!(
                            "node {id} splits on feature {} of {}",
                            split.feature,
                            self.n_features
                        );
                    }
                }
                None if node.value.len() != value_width => {
                    bail!(
                        "leaf {id} holds {} values, expected {value_width}",
                        node.value.len()
                    );
                }
                None => {}
            }
        }
        Ok(())
    }
}
