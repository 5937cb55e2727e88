// Command, transaction-id, and response-slot semantics.
use bytes::Bytes;
use fabriclink::FabricError;
use fabriclink::dispatch::{Command, ResponseSlot, TidAllocator};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

#[cfg(test)]
mod command_tests {
    use super::*;

    #[test]
    fn test_tids_are_pairwise_distinct_across_threads() {
        let tids = Arc::new(TidAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tids = tids.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| tids.next_tid()).collect::<Vec<u64>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for tid in handle.join().unwrap() {
                assert!(seen.insert(tid), "duplicate tid {tid}");
            }
        }
        // Tid 0 is reserved for unsolicited notices.
        assert!(!seen.contains(&0));
    }

    #[test]
    fn test_first_completion_wins() {
        let slot = ResponseSlot::new();
        slot.complete(Ok(Bytes::from_static(b"first")));
        slot.complete(Ok(Bytes::from_static(b"second")));
        slot.fail(FabricError::RequestExpired);

        assert_eq!(slot.try_result().unwrap().unwrap(), Bytes::from_static(b"first"));
    }

    #[test]
    fn test_cancel_completes_with_cancelled_error() {
        let slot = ResponseSlot::new();
        slot.cancel();
        assert!(slot.is_cancelled());
        assert!(slot.is_done());
        assert!(matches!(
            slot.try_result().unwrap(),
            Err(FabricError::Cancelled)
        ));

        // A response racing in after cancellation is discarded.
        slot.complete(Ok(Bytes::from_static(b"late")));
        assert!(matches!(
            slot.try_result().unwrap(),
            Err(FabricError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_wait_observes_completion_from_another_task() {
        let slot = Arc::new(ResponseSlot::new());
        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.wait().await })
        };

        tokio::task::yield_now().await;
        slot.complete(Ok(Bytes::from_static(b"payload")));
        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_wait_after_completion_returns_immediately() {
        let slot = ResponseSlot::new();
        slot.fail(FabricError::RequestExpired);
        assert!(matches!(
            slot.wait().await,
            Err(FabricError::RequestExpired)
        ));
    }

    #[tokio::test]
    async fn test_waiter_survives_requeue_of_the_same_command() {
        // Failover hands the same command to a second connection; the
        // original waiter must still observe the eventual completion.
        let cmd = Command::new(
            7,
            0x0011,
            Bytes::from_static(b"req"),
            Instant::now() + Duration::from_secs(60),
        );
        let waiter = {
            let response = cmd.response.clone();
            tokio::spawn(async move { response.wait().await })
        };

        let requeued = cmd.clone();
        tokio::task::yield_now().await;
        requeued.response.complete(Ok(Bytes::from_static(b"resp")));

        assert_eq!(waiter.await.unwrap().unwrap(), Bytes::from_static(b"resp"));
    }

    #[test]
    fn test_expiry_is_checked_against_the_given_instant() {
        let now = Instant::now();
        let cmd = Command::new(1, 0, Bytes::new(), now + Duration::from_millis(50));
        assert!(!cmd.is_expired(now));
        assert!(cmd.is_expired(now + Duration::from_millis(50)));
        assert!(cmd.is_expired(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_connection_in_progress_flag_round_trips() {
        let cmd = Command::new(1, 0, Bytes::new(), Instant::now() + Duration::from_secs(1));
        assert!(!cmd.is_connection_in_progress());
        cmd.set_connection_in_progress(true);
        let clone = cmd.clone();
        assert!(clone.is_connection_in_progress());
        clone.set_connection_in_progress(false);
        assert!(!cmd.is_connection_in_progress());
    }
}
