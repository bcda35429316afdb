use super::candidate_pair::*;

#[test]
fn test_pair_priority_formula() {
    // controlling local prio 0x7E0001FE, remote 0x7E0001FF: G < D, so the
    // G>D tie-break term contributes nothing
    let pair = CandidatePair::new(0, 0, 0x7E00_01FE, 0x7E00_01FF, true);
    let expected = (1u64 << 32) * 0x7E00_01FE + 2 * 0x7E00_01FF;
    assert_eq!(pair.priority(), expected);
}

#[test]
fn test_pair_priority_symmetric_between_roles() {
    let controlling = CandidatePair::new(0, 0, 100, 200, true);
    let controlled = CandidatePair::new(0, 0, 200, 100, false);
    assert_eq!(controlling.priority(), controlled.priority());
}

#[test]
fn test_pair_priority_tie_break_term() {
    // G > D contributes the +1
    let g_larger = CandidatePair::new(0, 0, 200, 100, true);
    let d_larger = CandidatePair::new(0, 0, 100, 200, true);
    assert_eq!(g_larger.priority(), d_larger.priority() + 1);
}

#[test]
fn test_sort_is_deterministic() {
    let build = || {
        vec![
            CandidatePair::new(0, 0, 100, 100, true),
            CandidatePair::new(1, 1, 300, 300, true),
            CandidatePair::new(2, 2, 200, 200, true),
        ]
    };

    let mut first = build();
    let mut second = build();
    sort_pairs(&mut first);
    sort_pairs(&mut second);

    let order: Vec<usize> = first.iter().map(|pair| pair.local).collect();
    assert_eq!(order, vec![1, 2, 0]);
    assert_eq!(first, second, "two sorts of the same input are identical");
}

#[test]
fn test_reset_progress() {
    let mut pair = CandidatePair::new(0, 0, 1, 1, true);
    pair.received_request = true;
    pair.received_response = true;
    pair.nominated = true;

    pair.reset_progress();
    assert!(!pair.received_request);
    assert!(!pair.received_response);
    assert!(!pair.nominated);
    assert!(!pair.succeeded());
}
