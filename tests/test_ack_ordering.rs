//! Property tests for ordered acknowledgment and lifecycle transitions

use iothub_transport::transport::mqtt::{AckTracker, AtomicTransportState, TransportState};
use iothub_transport::TransportError;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

proptest! {
    #[test]
    fn completions_release_packets_in_arrival_order(
        packet_ids in proptest::collection::vec(1u16..=u16::MAX, 1..64)
    ) {
        let mut tracker = AckTracker::new();
        let tokens: Vec<String> = packet_ids.iter().map(|id| tracker.track(*id)).collect();

        let mut acked = Vec::new();
        for token in &tokens {
            acked.push(tracker.complete(token).unwrap());
        }

        prop_assert_eq!(acked, packet_ids);
        prop_assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn only_the_oldest_token_can_complete(
        count in 2usize..32,
        pick in any::<proptest::sample::Index>()
    ) {
        let mut tracker = AckTracker::new();
        let tokens: Vec<String> = (0..count).map(|i| tracker.track(i as u16)).collect();
        let chosen = 1 + pick.index(count - 1);

        let result = tracker.complete(&tokens[chosen]);

        let is_out_of_order = matches!(result, Err(TransportError::OutOfOrderCompletion { .. }));
        prop_assert!(is_out_of_order);
        prop_assert_eq!(tracker.pending_count(), count);
    }

    #[test]
    fn tokens_from_a_previous_generation_are_stale(count in 1usize..16) {
        let mut tracker = AckTracker::new();
        let old: Vec<String> = (0..count).map(|i| tracker.track(i as u16)).collect();

        tracker.regenerate();
        tracker.track(99);

        for token in &old {
            let is_stale = matches!(
                tracker.complete(token),
                Err(TransportError::StaleOrInvalidToken { .. })
            );
            prop_assert!(is_stale);
        }
        prop_assert_eq!(tracker.pending_count(), 1);
    }
}

#[test]
fn test_exactly_one_thread_wins_each_transition() {
    // Arrange
    let state = Arc::new(AtomicTransportState::default());
    let winners = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    // Act
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let state = state.clone();
            let winners = winners.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                if state.try_transition(TransportState::NotInitialized, TransportState::Opening) {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Assert
    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(state.load(), TransportState::Opening);
}

#[test]
fn test_terminal_states_are_sticky_under_contention() {
    let state = Arc::new(AtomicTransportState::new(TransportState::Receiving));
    let barrier = Arc::new(Barrier::new(2));
    let terminal = [TransportState::Closed, TransportState::Error];

    let closer = {
        let state = state.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            state.move_to_if_possible(TransportState::Closed, &terminal)
        })
    };
    let faulter = {
        let state = state.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            state.move_to_if_possible(TransportState::Error, &terminal)
        })
    };
    let closed_from = closer.join().unwrap();
    let faulted_from = faulter.join().unwrap();

    // One caller moved out of Receiving; the other observed the terminal state
    let moved = [closed_from, faulted_from]
        .iter()
        .filter(|previous| **previous == TransportState::Receiving)
        .count();
    assert_eq!(moved, 1);
    let expected = if closed_from == TransportState::Receiving {
        TransportState::Closed
    } else {
        TransportState::Error
    };
    assert_eq!(state.load(), expected);
}
