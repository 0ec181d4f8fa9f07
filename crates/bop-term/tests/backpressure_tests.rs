use std::sync::Arc;

use bop_term::test_support::{publication_with_limit, set_tail};
use bop_term::{AtomicPosition, BackpressureKind, TermBuffers, TermError, calculate_position};

const CAPACITY: usize = 64 * 1024;

fn snapshot(terms: &TermBuffers) -> Vec<(Vec<u8>, i64, usize, bop_term::TermStatus, i32)> {
    terms
        .iter()
        .map(|term| {
            let mut log = vec![0u8; term.capacity()];
            term.copy_out(0, &mut log).expect("copy");
            (
                log,
                term.raw_tail_volatile(),
                term.high_water_mark_volatile(),
                term.status(),
                term.default_header_term_id(),
            )
        })
        .collect()
}

#[test]
fn limit_boundary_is_exclusive() {
    let limit = Arc::new(AtomicPosition::new(calculate_position(7, 1000, 16, 7)));
    assert_eq!(limit.get_volatile(), 1000);
    let (publication, _registry) = publication_with_limit(CAPACITY, 7, limit.clone());
    let terms = publication.term_buffers().expect("terms");
    set_tail(terms.get(0), 1000);

    let before = snapshot(&terms);
    let err = publication.offer(b"at the limit").expect_err("blocked");
    assert_eq!(err.backpressure_kind(), Some(BackpressureKind::FlowControl));
    let err = publication.try_claim(16).expect_err("blocked");
    assert_eq!(err.backpressure_kind(), Some(BackpressureKind::FlowControl));
    assert!(before == snapshot(&terms), "backpressure mutated a term");
    assert_eq!(publication.active_term_id(), 7);
    assert_eq!(publication.metrics().would_block_flow_control, 2);

    limit.set_ordered(1001);
    let position = publication.offer(b"one past").expect("offer");
    assert_eq!(position, 1000 + 64);
}

#[test]
fn publisher_stops_at_limit_and_resumes_when_it_moves() {
    let limit = Arc::new(AtomicPosition::new(1024));
    let (publication, _registry) = publication_with_limit(CAPACITY, 0, limit.clone());

    let mut accepted = Vec::new();
    loop {
        match publication.offer(&[9u8; 96]) {
            Ok(position) => accepted.push(position),
            Err(TermError::WouldBlock(BackpressureKind::FlowControl)) => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    // A frame is admitted while its start is below the limit.
    assert_eq!(accepted.len(), 8);
    assert_eq!(publication.position().expect("position"), 1024);

    assert!(limit.propose_max_ordered(2048));
    assert_eq!(publication.offer(&[9u8; 96]).expect("offer"), 1152);
}

#[test]
fn claim_is_gated_like_offer() {
    let limit = Arc::new(AtomicPosition::new(0));
    let (publication, _registry) = publication_with_limit(CAPACITY, 0, limit.clone());
    assert!(matches!(
        publication.try_claim(32),
        Err(TermError::WouldBlock(BackpressureKind::FlowControl))
    ));
    limit.set_ordered(1);
    let claim = publication.try_claim(32).expect("claim");
    assert_eq!(claim.position(), 64);
    claim.commit();
    assert!(publication.try_claim(32).is_err());
}
