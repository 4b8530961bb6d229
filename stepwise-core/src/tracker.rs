//! Per-run execution tracking and loop diagnosis.
//!
//! An [`ExecutionTracker`] records every state visited during one `execute`
//! call. When a run exceeds its step budget the tracker condenses the trail
//! into the repeating cycle responsible for it.
//!
//! Loop detection repeatedly replaces the trail by its longest substring that
//! occurs at least twice, until it is no longer than the number of states in
//! the machine or is a plain repetition of a unit that short. Repeated
//! substrings are found with a suffix automaton built over interned state ids.

use crate::collection::StateMap;
use crate::error::CoreError;
use std::collections::BTreeMap;

/// Default number of visits a single state may receive during one run.
pub const DEFAULT_MAX_CYCLES: usize = 20;

/// Breadcrumbs and visit counts for a single run.
#[derive(Debug, Clone)]
pub struct ExecutionTracker<'m> {
    states: &'m StateMap,
    breadcrumbs: Vec<usize>,
    counts: Vec<usize>,
}

impl<'m> ExecutionTracker<'m> {
    pub fn new(states: &'m StateMap) -> Self {
        Self {
            states,
            breadcrumbs: Vec::new(),
            counts: vec![0; states.len()],
        }
    }

    /// Records a visit to `state` and returns its new visit count.
    pub fn track(&mut self, state: &str) -> Result<usize, CoreError> {
        let id = self
            .states
            .id_of(state)
            .ok_or_else(|| CoreError::UnknownState {
                state: state.to_string(),
            })?;
        Ok(self.track_id(id))
    }

    pub(crate) fn track_id(&mut self, id: usize) -> usize {
        self.breadcrumbs.push(id);
        self.counts[id] += 1;
        self.counts[id]
    }

    /// Number of times `state` has been visited.
    pub fn count(&self, state: &str) -> usize {
        self.states
            .id_of(state)
            .map(|id| self.counts[id])
            .unwrap_or(0)
    }

    /// Visited state names, oldest first.
    pub fn breadcrumbs(&self) -> Vec<&str> {
        self.breadcrumbs
            .iter()
            .map(|&id| self.states.by_id(id).name())
            .collect()
    }

    /// Total number of tracked steps.
    pub fn steps(&self) -> usize {
        self.breadcrumbs.len()
    }

    /// Condenses the breadcrumbs into the cycle that keeps repeating.
    ///
    /// If the trail contains no repetition it is returned whole.
    pub fn detect_execution_loop(&self) -> Vec<String> {
        let limit = self.states.len().max(1);
        let mut candidate: &[usize] = &self.breadcrumbs;

        loop {
            let period = smallest_period(candidate);
            if period < candidate.len() && period <= limit {
                candidate = &candidate[..period];
                break;
            }
            if candidate.len() <= limit {
                break;
            }
            match longest_repeat(candidate) {
                Some(repeat) => candidate = repeat,
                None => break,
            }
        }

        candidate
            .iter()
            .map(|&id| self.states.by_id(id).name().to_string())
            .collect()
    }
}

/// Returns the longest substring of `seq` occurring at least twice
/// (occurrences may overlap). Ties go to the earliest occurrence.
pub(crate) fn longest_repeat<T: Ord + Copy>(seq: &[T]) -> Option<&[T]> {
    let mut automaton = SuffixAutomaton::with_capacity(seq.len());
    for (pos, &symbol) in seq.iter().enumerate() {
        automaton.extend(symbol, pos);
    }

    automaton
        .longest_repeat()
        .map(|(end, len)| &seq[end + 1 - len..=end])
}

/// Length of the shortest prefix `p` such that `seq[i] == seq[i + p]` for all `i`.
pub(crate) fn smallest_period<T: PartialEq>(seq: &[T]) -> usize {
    if seq.is_empty() {
        return 0;
    }

    // Prefix function
    let mut pi = vec![0usize; seq.len()];
    for i in 1..seq.len() {
        let mut k = pi[i - 1];
        while k > 0 && seq[i] != seq[k] {
            k = pi[k - 1];
        }
        if seq[i] == seq[k] {
            k += 1;
        }
        pi[i] = k;
    }

    seq.len() - pi[seq.len() - 1]
}

#[derive(Debug, Clone)]
struct Node<T> {
    len: usize,
    link: Option<usize>,
    next: BTreeMap<T, usize>,
    /// End position of the first occurrence.
    first_end: usize,
    /// Number of end positions; filled in by `longest_repeat`.
    occurrences: usize,
}

#[derive(Debug)]
struct SuffixAutomaton<T> {
    nodes: Vec<Node<T>>,
    last: usize,
}

impl<T: Ord + Copy> SuffixAutomaton<T> {
    fn with_capacity(len: usize) -> Self {
        let mut nodes = Vec::with_capacity(2 * len + 1);
        nodes.push(Node {
            len: 0,
            link: None,
            next: BTreeMap::new(),
            first_end: 0,
            occurrences: 0,
        });
        Self { nodes, last: 0 }
    }

    fn extend(&mut self, symbol: T, pos: usize) {
        let cur = self.nodes.len();
        self.nodes.push(Node {
            len: self.nodes[self.last].len + 1,
            link: None,
            next: BTreeMap::new(),
            first_end: pos,
            occurrences: 1,
        });

        let mut p = Some(self.last);
        while let Some(id) = p {
            if self.nodes[id].next.contains_key(&symbol) {
                break;
            }
            self.nodes[id].next.insert(symbol, cur);
            p = self.nodes[id].link;
        }

        match p {
            None => self.nodes[cur].link = Some(0),
            Some(id) => {
                let q = self.nodes[id].next[&symbol];
                if self.nodes[id].len + 1 == self.nodes[q].len {
                    self.nodes[cur].link = Some(q);
                } else {
                    let clone = self.nodes.len();
                    let mut node = self.nodes[q].clone();
                    node.len = self.nodes[id].len + 1;
                    node.occurrences = 0;
                    self.nodes.push(node);

                    let mut p = Some(id);
                    while let Some(id) = p {
                        if self.nodes[id].next.get(&symbol) != Some(&q) {
                            break;
                        }
                        self.nodes[id].next.insert(symbol, clone);
                        p = self.nodes[id].link;
                    }
                    self.nodes[q].link = Some(clone);
                    self.nodes[cur].link = Some(clone);
                }
            }
        }

        self.last = cur;
    }

    /// Returns `(end, len)` of the longest substring with two or more end positions.
    fn longest_repeat(&mut self) -> Option<(usize, usize)> {
        // Propagate occurrence counts from longer to shorter states.
        let max_len = self.nodes[self.last].len;
        let mut buckets = vec![Vec::new(); max_len + 1];
        for (id, node) in self.nodes.iter().enumerate() {
            buckets[node.len].push(id);
        }
        for id in buckets.into_iter().rev().flatten() {
            if let Some(link) = self.nodes[id].link {
                self.nodes[link].occurrences += self.nodes[id].occurrences;
            }
        }

        self.nodes
            .iter()
            .skip(1)
            .filter(|node| node.occurrences >= 2)
            .max_by(|a, b| a.len.cmp(&b.len).then(b.first_end.cmp(&a.first_end)))
            .map(|node| (node.first_end, node.len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use proptest::prelude::*;

    fn state_map(names: &[&str]) -> StateMap {
        let mut map = StateMap::new();
        for name in names {
            map.insert(State::active(*name)).unwrap();
        }
        map
    }

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn test_longest_repeat() {
        let s = chars("banana");
        assert_eq!(longest_repeat(&s), Some(&chars("ana")[..]));

        let s = chars("abcd");
        assert_eq!(longest_repeat(&s), None);

        let s = chars("aaaa");
        assert_eq!(longest_repeat(&s), Some(&chars("aaa")[..]));

        // Earliest occurrence wins ties
        let s = chars("xyabxyab");
        assert_eq!(longest_repeat(&s), Some(&chars("xyab")[..]));
    }

    #[test]
    fn test_smallest_period() {
        assert_eq!(smallest_period(&chars("abcabcab")), 3);
        assert_eq!(smallest_period(&chars("abca")), 3);
        assert_eq!(smallest_period(&chars("abc")), 3);
        assert_eq!(smallest_period(&chars("aaaa")), 1);
        assert_eq!(smallest_period::<char>(&[]), 0);
    }

    #[test]
    fn test_track_counts() {
        let map = state_map(&["a", "b"]);
        let mut tracker = ExecutionTracker::new(&map);

        assert_eq!(tracker.track("a").unwrap(), 1);
        assert_eq!(tracker.track("b").unwrap(), 1);
        assert_eq!(tracker.track("a").unwrap(), 2);
        assert_eq!(tracker.count("a"), 2);
        assert_eq!(tracker.count("missing"), 0);
        assert_eq!(tracker.breadcrumbs(), vec!["a", "b", "a"]);
        assert_eq!(tracker.steps(), 3);

        assert!(matches!(
            tracker.track("zzz"),
            Err(CoreError::UnknownState { .. })
        ));
    }

    #[test]
    fn test_detect_three_state_cycle() {
        let map = state_map(&["start", "a", "b", "c", "end"]);
        let mut tracker = ExecutionTracker::new(&map);

        tracker.track("start").unwrap();
        for _ in 0..20 {
            for name in ["a", "b", "c"] {
                tracker.track(name).unwrap();
            }
        }
        tracker.track("a").unwrap();

        assert_eq!(tracker.detect_execution_loop(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_detect_cycle_with_noisy_prefix() {
        let map = state_map(&["s", "x", "y", "p", "q"]);
        let mut tracker = ExecutionTracker::new(&map);

        for name in ["s", "x", "y", "x"] {
            tracker.track(name).unwrap();
        }
        for _ in 0..15 {
            tracker.track("p").unwrap();
            tracker.track("q").unwrap();
        }

        let cycle = tracker.detect_execution_loop();
        assert!(
            cycle == vec!["p", "q"] || cycle == vec!["q", "p"],
            "unexpected cycle {:?}",
            cycle
        );
    }

    #[test]
    fn test_short_trail_is_reported_whole() {
        let map = state_map(&["a", "b", "c"]);
        let mut tracker = ExecutionTracker::new(&map);
        for name in ["a", "b", "c"] {
            tracker.track(name).unwrap();
        }
        assert_eq!(tracker.detect_execution_loop(), vec!["a", "b", "c"]);
    }

    proptest! {
        #[test]
        fn counts_match_breadcrumbs(visits in proptest::collection::vec(0usize..4, 0..64)) {
            let map = state_map(&["a", "b", "c", "d"]);
            let names = ["a", "b", "c", "d"];
            let mut tracker = ExecutionTracker::new(&map);
            for &v in &visits {
                tracker.track(names[v]).unwrap();
            }

            let crumbs = tracker.breadcrumbs();
            for name in names {
                let occurrences = crumbs.iter().filter(|&&c| c == name).count();
                prop_assert_eq!(tracker.count(name), occurrences);
            }
        }

        #[test]
        fn periodic_trail_yields_rotation_of_unit(len in 2usize..6, reps in 8usize..20, offset in 0usize..6) {
            let names: Vec<String> = (0..8).map(|i| format!("s{}", i)).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let map = state_map(&refs);
            let mut tracker = ExecutionTracker::new(&map);

            let unit: Vec<usize> = (0..len).collect();
            for i in 0..(len * reps + offset % len) {
                tracker.track(refs[unit[i % len]]).unwrap();
            }

            let cycle = tracker.detect_execution_loop();
            prop_assert_eq!(cycle.len(), len);
            let expected: Vec<String> = unit.iter().map(|&i| names[i].clone()).collect();
            let doubled = [expected.clone(), expected].concat();
            prop_assert!(doubled.windows(len).any(|w| w == cycle.as_slice()));
        }
    }
}
