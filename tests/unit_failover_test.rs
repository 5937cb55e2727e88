// Failover manager tests against a scripted prober.
use async_trait::async_trait;
use fabriclink::FabricError;
use fabriclink::config::{FailoverConfig, HostInfo};
use fabriclink::core::events::EventBus;
use fabriclink::failover::{FailoverManager, ProbeSession, Prober};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// How one scripted host behaves during probing.
#[derive(Clone)]
enum HostScript {
    /// Every connect attempt is refused.
    ConnectRefused,
    /// Connects and passes every verification stage.
    Healthy { sms: Vec<u64> },
    /// The first `fail_first` connect attempts fail, then healthy.
    FlakyConnect { fail_first: u32, sms: Vec<u64> },
    /// The connect never completes; only the deadline can end it.
    Hang,
}

struct ScriptedProber {
    scripts: HashMap<String, HostScript>,
    connect_attempts: Mutex<HashMap<String, u32>>,
}

impl ScriptedProber {
    fn new(scripts: Vec<(HostInfo, HostScript)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .into_iter()
                .map(|(host, script)| (host.endpoint(), script))
                .collect(),
            connect_attempts: Mutex::new(HashMap::new()),
        })
    }

    fn attempts(&self, host: &HostInfo) -> u32 {
        *self
            .connect_attempts
            .lock()
            .unwrap()
            .get(&host.endpoint())
            .unwrap_or(&0)
    }
}

struct ScriptedSession {
    sms: Vec<u64>,
}

#[async_trait]
impl ProbeSession for ScriptedSession {
    async fn sm_identities(&mut self) -> Result<Vec<u64>, FabricError> {
        Ok(self.sms.clone())
    }

    async fn check_pm(&mut self) -> Result<(), FabricError> {
        Ok(())
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn open(&self, host: &HostInfo) -> Result<Box<dyn ProbeSession>, FabricError> {
        let endpoint = host.endpoint();
        let attempt = {
            let mut attempts = self.connect_attempts.lock().unwrap();
            let entry = attempts.entry(endpoint.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        match self.scripts.get(&endpoint) {
            Some(HostScript::ConnectRefused) | None => Err(FabricError::ChannelClosed(format!(
                "{endpoint} refused the connection"
            ))),
            Some(HostScript::Healthy { sms }) => Ok(Box::new(ScriptedSession { sms: sms.clone() })),
            Some(HostScript::FlakyConnect { fail_first, sms }) => {
                if attempt <= *fail_first {
                    Err(FabricError::ConnectTimeout(endpoint))
                } else {
                    Ok(Box::new(ScriptedSession { sms: sms.clone() }))
                }
            }
            Some(HostScript::Hang) => futures::future::pending().await,
        }
    }

    async fn verify_capacity(&self, _host: &HostInfo, _count: usize) -> Result<(), FabricError> {
        Ok(())
    }
}

fn fast_config() -> FailoverConfig {
    FailoverConfig {
        deadline: Duration::from_secs(30),
        poll_interval: Duration::from_millis(20),
        retry_delay: Duration::from_millis(10),
        connect_retries: 2,
        sm_list_retries: 2,
        pm_retries: 2,
        min_connections: 3,
    }
}

fn drain_progress(rx: &mut broadcast::Receiver<fabriclink::core::events::FailoverProgress>) -> Vec<u8> {
    let mut seen = Vec::new();
    while let Ok(p) = rx.try_recv() {
        seen.push(p.percent);
    }
    seen
}

fn assert_monotone_to_100(seen: &[u8]) {
    assert!(!seen.is_empty());
    for pair in seen.windows(2) {
        assert!(pair[0] <= pair[1], "progress regressed: {seen:?}");
    }
    assert_eq!(*seen.last().unwrap(), 100, "no terminal report: {seen:?}");
    assert!(seen[..seen.len() - 1].iter().all(|p| *p < 100));
}

#[cfg(test)]
mod failover_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_active_host_fails_over_to_next_candidate() {
        let host_a = HostInfo::new("fe-a", 3245);
        let host_b = HostInfo::new("fe-b", 3245);
        let prober = ScriptedProber::new(vec![
            (host_a.clone(), HostScript::ConnectRefused),
            (host_b.clone(), HostScript::Healthy { sms: vec![11, 22] }),
        ]);
        let events = Arc::new(EventBus::new());
        let mut progress_rx = events.subscribe_progress();

        let manager = FailoverManager::new(fast_config(), prober.clone(), events, Vec::new());
        let outcome = manager
            .run(vec![(1, host_b.clone()), (0, host_a.clone())])
            .await
            .unwrap();

        assert_eq!(outcome.host_index, 1);
        assert_eq!(outcome.sm_identities, vec![11, 22]);
        assert_eq!(prober.attempts(&host_b), 1);
        // The refused host was never reached; the first candidate won.
        assert_eq!(prober.attempts(&host_a), 0);
        assert_monotone_to_100(&drain_progress(&mut progress_rx));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_then_success_on_same_host() {
        let host = HostInfo::new("fe-a", 3245);
        let prober = ScriptedProber::new(vec![(
            host.clone(),
            HostScript::FlakyConnect {
                fail_first: 1,
                sms: vec![7],
            },
        )]);
        let events = Arc::new(EventBus::new());
        let mut progress_rx = events.subscribe_progress();

        let manager = FailoverManager::new(fast_config(), prober.clone(), events, Vec::new());
        let outcome = manager.run(vec![(0, host.clone())]).await.unwrap();

        assert_eq!(outcome.host_index, 0);
        assert_eq!(prober.attempts(&host), 2);
        assert_monotone_to_100(&drain_progress(&mut progress_rx));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_hosts_exhausted_terminates_unsuccessfully() {
        let hosts: Vec<HostInfo> = (0..3).map(|i| HostInfo::new(format!("fe-{i}"), 3245)).collect();
        let prober = ScriptedProber::new(
            hosts
                .iter()
                .map(|h| (h.clone(), HostScript::ConnectRefused))
                .collect(),
        );
        let events = Arc::new(EventBus::new());
        let mut progress_rx = events.subscribe_progress();

        let config = fast_config();
        let manager = FailoverManager::new(config.clone(), prober.clone(), events, Vec::new());
        let candidates = hosts.iter().cloned().enumerate().collect();
        let err = manager.run(candidates).await.unwrap_err();

        assert!(matches!(err, FabricError::FailoverFailed(_)));
        // Every host burned exactly its connect retry budget; no loops.
        for host in &hosts {
            assert_eq!(prober.attempts(host), config.connect_retries);
        }
        assert_monotone_to_100(&drain_progress(&mut progress_rx));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_subnet_host_is_eliminated() {
        let wrong = HostInfo::new("fe-wrong", 3245);
        let right = HostInfo::new("fe-right", 3245);
        let prober = ScriptedProber::new(vec![
            (wrong.clone(), HostScript::Healthy { sms: vec![99] }),
            (right.clone(), HostScript::Healthy { sms: vec![1, 2] }),
        ]);
        let events = Arc::new(EventBus::new());

        // Identities observed before connectivity was lost.
        let known_sms = vec![1];
        let manager = FailoverManager::new(fast_config(), prober.clone(), events, known_sms);
        let outcome = manager
            .run(vec![(0, wrong.clone()), (1, right.clone())])
            .await
            .unwrap();

        assert_eq!(outcome.host_index, 1);
        assert_eq!(outcome.sm_identities, vec![1, 2]);
        // The wrong-subnet host reconnected for each SM-stage retry.
        assert_eq!(prober.attempts(&wrong), fast_config().sm_list_retries);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_known_set_accepts_any_subnet() {
        let host = HostInfo::new("fe-a", 3245);
        let prober = ScriptedProber::new(vec![(host.clone(), HostScript::Healthy { sms: vec![42] })]);
        let events = Arc::new(EventBus::new());

        let manager = FailoverManager::new(fast_config(), prober, events, Vec::new());
        let outcome = manager.run(vec![(0, host)]).await.unwrap();
        assert_eq!(outcome.sm_identities, vec![42]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_a_hanging_probe() {
        let host = HostInfo::new("fe-hang", 3245);
        let prober = ScriptedProber::new(vec![(host.clone(), HostScript::Hang)]);
        let events = Arc::new(EventBus::new());
        let mut progress_rx = events.subscribe_progress();

        let config = FailoverConfig {
            deadline: Duration::from_millis(300),
            poll_interval: Duration::from_millis(50),
            ..fast_config()
        };
        let manager = FailoverManager::new(config, prober, events, Vec::new());
        let err = manager.run(vec![(0, host)]).await.unwrap_err();

        assert!(matches!(err, FabricError::FailoverFailed(_)));
        assert!(err.to_string().contains("deadline"));
        assert_monotone_to_100(&drain_progress(&mut progress_rx));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_candidates_fails_immediately() {
        let prober = ScriptedProber::new(Vec::new());
        let events = Arc::new(EventBus::new());
        let mut progress_rx = events.subscribe_progress();

        let manager = FailoverManager::new(fast_config(), prober, events, Vec::new());
        let err = manager.run(Vec::new()).await.unwrap_err();
        assert!(matches!(err, FabricError::FailoverFailed(_)));
        assert_eq!(drain_progress(&mut progress_rx), vec![100]);
    }
}
