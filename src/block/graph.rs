use super::statement::Statement;
use crate::error::{FlowError, Result};
use std::collections::{BTreeSet, HashMap};

/// Producer → consumer graph over the statements of a block.
///
/// A statement reading `n` depends on the nearest earlier statement
/// writing `n`. When no earlier statement writes it, every later writer
/// becomes a dependency, so out-of-order blocks get sorted and mutual
/// references surface as cycles.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    inputs: Vec<BTreeSet<String>>,
    outputs: Vec<BTreeSet<String>>,
    forward: Vec<Vec<usize>>,
    backward: Vec<Vec<usize>>,
    labels: Vec<String>,
}

impl DependencyGraph {
    pub fn build(statements: &[Statement]) -> Self {
        let inputs: Vec<_> = statements.iter().map(Statement::inputs).collect();
        let outputs: Vec<_> = statements.iter().map(Statement::outputs).collect();
        let labels = statements.iter().map(Statement::label).collect();

        let mut producers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, names) in outputs.iter().enumerate() {
            for name in names {
                producers.entry(name.as_str()).or_default().push(idx);
            }
        }

        let n = statements.len();
        let mut forward = vec![Vec::new(); n];
        let mut backward = vec![Vec::new(); n];
        for (consumer, names) in inputs.iter().enumerate() {
            let mut sources = BTreeSet::new();
            for name in names {
                let Some(writers) = producers.get(name.as_str()) else {
                    continue;
                };
                match writers.iter().rev().find(|&&w| w < consumer) {
                    Some(&nearest) => {
                        sources.insert(nearest);
                    }
                    // `x = f(x)` with no earlier writer reads the incoming value
                    None if outputs[consumer].contains(name) => {}
                    None => sources.extend(writers.iter().copied().filter(|&w| w != consumer)),
                }
            }
            for source in sources {
                forward[source].push(consumer);
                backward[consumer].push(source);
            }
        }

        Self {
            inputs,
            outputs,
            forward,
            backward,
            labels,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Statements that `index` depends on directly.
    pub fn dependencies(&self, index: usize) -> &[usize] {
        self.backward.get(index).map(Vec::as_slice).unwrap_or_default()
    }

    /// Statement indices in dependency order. Among ready statements the
    /// earliest in the block runs first, so an already ordered block keeps
    /// its order.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let all: Vec<bool> = vec![true; self.len()];
        self.sort_subset(&all)
    }

    fn sort_subset(&self, active: &[bool]) -> Result<Vec<usize>> {
        let n = self.len();
        let mut in_degree = vec![0usize; n];
        for idx in (0..n).filter(|&i| active[i]) {
            in_degree[idx] = self.backward[idx].iter().filter(|&&p| active[p]).count();
        }

        let mut ready: BTreeSet<usize> = (0..n)
            .filter(|&i| active[i] && in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(idx) = ready.pop_first() {
            order.push(idx);
            for &next in &self.forward[idx] {
                if !active[next] {
                    continue;
                }
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        let expected = active.iter().filter(|&&a| a).count();
        if order.len() < expected {
            let statements = (0..n)
                .filter(|&i| active[i] && in_degree[i] > 0)
                .map(|i| self.labels[i].clone())
                .collect();
            return Err(FlowError::Cycle { statements });
        }
        Ok(order)
    }

    /// Indices, in dependency order, of the statements needed to compute
    /// `outputs` that are affected by `inputs`.
    ///
    /// The result is the backward closure from the producers of `outputs`
    /// intersected with the forward closure from the consumers of
    /// `inputs`. A missing side places no constraint.
    pub fn restrict(&self, inputs: Option<&BTreeSet<String>>, outputs: Option<&BTreeSet<String>>) -> Result<Vec<usize>> {
        let n = self.len();
        let mut active = vec![true; n];

        if let Some(outputs) = outputs {
            let seeds: Vec<usize> = (0..n)
                .filter(|&i| !self.outputs[i].is_disjoint(outputs))
                .collect();
            let reachable = Self::reachability(&seeds, &self.backward, n);
            for (flag, hit) in active.iter_mut().zip(reachable) {
                *flag &= hit;
            }
        }

        if let Some(inputs) = inputs {
            let seeds: Vec<usize> = (0..n)
                .filter(|&i| !self.inputs[i].is_disjoint(inputs))
                .collect();
            let reachable = Self::reachability(&seeds, &self.forward, n);
            for (flag, hit) in active.iter_mut().zip(reachable) {
                *flag &= hit;
            }
        }

        self.sort_subset(&active)
    }

    /// Free variables: names read before any statement produces them.
    pub fn inputs_of(&self) -> Result<BTreeSet<String>> {
        let mut produced = BTreeSet::new();
        let mut free = BTreeSet::new();
        for idx in self.topological_order()? {
            free.extend(self.inputs[idx].difference(&produced).cloned());
            produced.extend(self.outputs[idx].iter().cloned());
        }
        Ok(free)
    }

    pub fn outputs_of(&self) -> BTreeSet<String> {
        self.outputs.iter().flatten().cloned().collect()
    }

    fn reachability(seeds: &[usize], adjacency: &[Vec<usize>], n: usize) -> Vec<bool> {
        let mut reachable = vec![false; n];
        let mut stack = Vec::new();
        for &seed in seeds {
            if !reachable[seed] {
                reachable[seed] = true;
                stack.push(seed);
            }
        }
        while let Some(node) = stack.pop() {
            for &next in &adjacency[node] {
                if !reachable[next] {
                    reachable[next] = true;
                    stack.push(next);
                }
            }
        }
        reachable
    }
}
