// tests/property/ordering_test.rs

//! Property-based tests for outbound ordering
//! Tests that the outbound queue writes every command exactly once, in enqueue order

use futures::StreamExt;
use futures::channel::mpsc;
use futures::sink::SinkExt;
use proptest::prelude::*;
use questlink::core::SessionError;
use questlink::core::protocol::{Command, Reserved};
use questlink::core::session::{OutboundQueue, QueueHooks};
use std::sync::Arc;
use std::time::Duration;

struct NoHooks;

impl QueueHooks for NoHooks {
    fn on_idle(&self) {}
    fn on_write_failed(&self, _error: &SessionError) {}
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_queue_preserves_order(
        batches in proptest::collection::vec(1usize..40, 1..10),
        stop_early in any::<bool>()
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let received = rt.block_on(async {
            let (tx, rx) = mpsc::unbounded();
            let sink = tx.sink_map_err(|e| SessionError::Internal(e.to_string()));
            let queue = OutboundQueue::new(Duration::from_secs(60));
            queue.start(sink, Arc::new(NoHooks)).unwrap();

            let mut next = 0i64;
            for batch in &batches {
                for _ in 0..*batch {
                    queue.enqueue(Command::new(Reserved::Message).with("seq", next)).unwrap();
                    next += 1;
                }
                tokio::task::yield_now().await;
            }
            if stop_early {
                queue.stop().await;
                rx.map(|c| c.get_i64("seq").unwrap()).collect::<Vec<_>>().await
            } else {
                rx.take(next as usize)
                    .map(|c| c.get_i64("seq").unwrap())
                    .collect::<Vec<_>>()
                    .await
            }
        });

        let total: usize = batches.iter().sum();
        prop_assert_eq!(received, (0..total as i64).collect::<Vec<_>>());
    }
}
