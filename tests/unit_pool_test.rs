// Pool sizing policy and round-robin selection tests.
use fabriclink::config::HostInfo;
use fabriclink::core::events::EventBus;
use fabriclink::dispatch::{
    Connection, ConnectionPool, DefaultPoolingPolicy, NoPoolingPolicy, PoolingPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc};

#[cfg(test)]
mod pool_tests {
    use super::*;

    #[test]
    fn test_default_policy_targets_clamped_multiple_of_sessions() {
        let policy = DefaultPoolingPolicy::default();

        // target = clamp(3 * sessions, 3, 10)
        assert_eq!(policy.desired_growth(0, 0), 3);
        assert_eq!(policy.desired_growth(0, 1), 3);
        assert_eq!(policy.desired_growth(0, 2), 6);
        assert_eq!(policy.desired_growth(0, 5), 10);
        assert_eq!(policy.desired_growth(0, 50), 10);

        // Growth is the difference against what is already there.
        assert_eq!(policy.desired_growth(3, 1), 0);
        assert_eq!(policy.desired_growth(10, 1), -7);
        assert_eq!(policy.desired_growth(6, 2), 0);
        assert_eq!(policy.desired_growth(4, 2), 2);
    }

    #[test]
    fn test_no_pooling_policy_never_changes_anything() {
        let policy = NoPoolingPolicy;
        assert_eq!(policy.desired_growth(0, 0), 0);
        assert_eq!(policy.desired_growth(0, 100), 0);
        assert_eq!(policy.desired_growth(25, 0), 0);
    }

    async fn local_listener() -> (TcpListener, HostInfo) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, HostInfo::new("127.0.0.1", port))
    }

    fn spawn_handle(
        id: u64,
        host: &HostInfo,
        events: &Arc<EventBus>,
        workers: &Arc<Semaphore>,
    ) -> fabriclink::dispatch::ConnectionHandle {
        let (result_tx, _result_rx) = mpsc::unbounded_channel();
        Connection::spawn(
            id,
            host.clone(),
            false,
            Duration::from_secs(5),
            result_tx,
            events.clone(),
            workers.clone(),
            None,
        )
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_member_once_per_cycle() {
        let (listener, host) = local_listener().await;
        // Keep accepted sockets alive so the connections stay up.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let events = Arc::new(EventBus::new());
        let workers = Arc::new(Semaphore::new(4));
        let mut pool = ConnectionPool::new();
        for id in 1..=4u64 {
            pool.add(spawn_handle(id, &host, &events, &workers));
        }

        let mut order = Vec::new();
        for _ in 0..8 {
            order.push(pool.next_connection().unwrap().id());
        }
        // Two full cycles in a stable order, each member exactly once per
        // cycle.
        assert_eq!(order[..4], order[4..]);
        let mut first_cycle = order[..4].to_vec();
        first_cycle.sort_unstable();
        assert_eq!(first_cycle, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_removal_keeps_rotation_stable() {
        let (listener, host) = local_listener().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let events = Arc::new(EventBus::new());
        let workers = Arc::new(Semaphore::new(4));
        let mut pool = ConnectionPool::new();
        for id in 1..=3u64 {
            pool.add(spawn_handle(id, &host, &events, &workers));
        }

        assert_eq!(pool.next_connection().unwrap().id(), 1);
        assert!(pool.remove(2).is_some());
        assert_eq!(pool.len(), 2);

        // Remaining members still alternate without skipping or repeating.
        let a = pool.next_connection().unwrap().id();
        let b = pool.next_connection().unwrap().id();
        let c = pool.next_connection().unwrap().id();
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert!(pool.get(2).is_none());
    }

    #[tokio::test]
    async fn test_drain_all_empties_the_pool() {
        let (listener, host) = local_listener().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let events = Arc::new(EventBus::new());
        let workers = Arc::new(Semaphore::new(4));
        let mut pool = ConnectionPool::new();
        for id in 1..=3u64 {
            pool.add(spawn_handle(id, &host, &events, &workers));
        }

        let drained = pool.drain_all();
        assert_eq!(drained.len(), 3);
        assert!(pool.is_empty());
        assert!(pool.next_connection().is_none());
    }
}
