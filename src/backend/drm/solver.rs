//! CRTC allocation
//!
//! On hotplug the set of connected connectors changes and CRTCs have to be
//! (re)assigned. The solver maximises the number of connectors that want
//! and get a CRTC, breaking ties towards the previous mapping so running
//! outputs move as little as possible. A connector that is enabled and
//! connected is pinned: it must keep exactly its current CRTC, and if no
//! solution satisfies that, the whole request fails and the previous
//! mapping stays in force.

/// Per-connector input to the solver
#[derive(Debug, Clone, Copy)]
pub(crate) struct SolverInput {
    /// Bitmask of CRTC indices this connector can be driven by
    pub possible: u32,
    /// Whether the connector wants a CRTC at all
    pub wants: bool,
    /// The currently assigned CRTC index
    pub current: Option<usize>,
    /// Enabled and connected: must keep `current`
    pub pinned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Score {
    matched_wants: usize,
    unchanged: usize,
}

struct Search<'a> {
    inputs: &'a [SolverInput],
    best: Option<(Score, Vec<Option<usize>>)>,
    assignment: Vec<Option<usize>>,
}

impl Search<'_> {
    fn run(&mut self, index: usize, used: u32, score: Score) {
        if index == self.inputs.len() {
            if self.best.as_ref().map(|(best, _)| score > *best).unwrap_or(true) {
                self.best = Some((score, self.assignment.clone()));
            }
            return;
        }

        // upper bound check: even matching every remaining want cannot beat
        // the best solution
        if let Some((best, _)) = &self.best {
            let remaining: usize = self.inputs[index..].iter().filter(|input| input.wants).count();
            let bound = Score {
                matched_wants: score.matched_wants + remaining,
                unchanged: score.unchanged + (self.inputs.len() - index),
            };
            if bound < *best {
                return;
            }
        }

        let input = &self.inputs[index];

        if input.pinned {
            // must keep exactly the current crtc
            let Some(current) = input.current else {
                return;
            };
            let bit = 1u32 << current;
            if used & bit != 0 || input.possible & bit == 0 {
                return;
            }
            self.assignment[index] = Some(current);
            self.run(
                index + 1,
                used | bit,
                Score {
                    matched_wants: score.matched_wants + usize::from(input.wants),
                    unchanged: score.unchanged + 1,
                },
            );
            self.assignment[index] = None;
            return;
        }

        if input.wants {
            // try the current crtc first so ties favor stability
            let candidates = input
                .current
                .into_iter()
                .chain((0..32).filter(|&crtc| Some(crtc) != input.current));
            for crtc in candidates {
                let bit = 1u32 << crtc;
                if input.possible & bit == 0 || used & bit != 0 {
                    continue;
                }
                self.assignment[index] = Some(crtc);
                self.run(
                    index + 1,
                    used | bit,
                    Score {
                        matched_wants: score.matched_wants + 1,
                        unchanged: score.unchanged + usize::from(input.current == Some(crtc)),
                    },
                );
                self.assignment[index] = None;
            }
        }

        // leaving the connector unmatched is always an option
        self.run(
            index + 1,
            used,
            Score {
                matched_wants: score.matched_wants,
                unchanged: score.unchanged + usize::from(input.current.is_none()),
            },
        );
    }
}

/// Compute a connector to CRTC mapping
///
/// Returns `None` when the pinned constraints cannot be satisfied; the
/// caller must then retain its previous mapping and report the failure.
pub(crate) fn assign_crtcs(inputs: &[SolverInput]) -> Option<Vec<Option<usize>>> {
    let mut search = Search {
        inputs,
        best: None,
        assignment: vec![None; inputs.len()],
    };
    search.run(0, 0, Score {
        matched_wants: 0,
        unchanged: 0,
    });

    let (_, solution) = search.best?;
    // a solution that drops a pinned connector is no solution
    for (input, assigned) in inputs.iter().zip(solution.iter()) {
        if input.pinned && *assigned != input.current {
            return None;
        }
    }
    Some(solution)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(possible: u32, wants: bool, current: Option<usize>, pinned: bool) -> SolverInput {
        SolverInput {
            possible,
            wants,
            current,
            pinned,
        }
    }

    #[test]
    fn simple_assignment() {
        let inputs = [input(0b01, true, None, false), input(0b11, true, None, false)];
        let solution = assign_crtcs(&inputs).unwrap();
        assert_eq!(solution, vec![Some(0), Some(1)]);
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let inputs = [
            input(0b111, true, None, false),
            input(0b110, true, None, false),
            input(0b100, true, None, false),
        ];
        let first = assign_crtcs(&inputs).unwrap();
        let second = assign_crtcs(&inputs).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.iter().flatten().count(), 3);
    }

    #[test]
    fn prefers_previous_mapping() {
        // both connectors could swap crtcs, but should not
        let inputs = [
            input(0b11, true, Some(1), false),
            input(0b11, true, Some(0), false),
        ];
        let solution = assign_crtcs(&inputs).unwrap();
        assert_eq!(solution, vec![Some(1), Some(0)]);
    }

    #[test]
    fn pinned_connector_never_migrates() {
        // the pinned connector keeps crtc 0 even though giving it up would
        // let both match
        let inputs = [
            input(0b01, true, Some(0), true),
            input(0b01, true, None, false),
        ];
        let solution = assign_crtcs(&inputs).unwrap();
        assert_eq!(solution[0], Some(0));
        assert_eq!(solution[1], None);
    }

    #[test]
    fn unsolvable_pin_fails() {
        // pinned to a crtc it cannot reach anymore
        let inputs = [input(0b10, true, Some(0), true)];
        assert!(assign_crtcs(&inputs).is_none());
    }

    #[test]
    fn removing_matched_connector_is_stable() {
        let all = [
            input(0b111, true, Some(0), false),
            input(0b111, true, Some(1), false),
            input(0b111, true, Some(2), false),
        ];
        let full = assign_crtcs(&all).unwrap();

        let remaining = [all[0], all[2]];
        let reduced = assign_crtcs(&remaining).unwrap();
        assert_eq!(reduced[0], full[0]);
        assert_eq!(reduced[1], full[2]);
    }

    #[test]
    fn maximises_matches_over_stability() {
        // keeping connector 0 on crtc 0 would leave connector 1 unmatched
        let inputs = [
            input(0b11, true, Some(0), false),
            input(0b01, true, None, false),
        ];
        let solution = assign_crtcs(&inputs).unwrap();
        assert_eq!(solution, vec![Some(1), Some(0)]);
    }
}
