//! Node Module Tests
//!
//! Runs real `NodeService` actors over the in-memory network with tokio's
//! paused clock, so timers fire as soon as every task is idle.
//!
//! ## Test Scopes
//! - **Runtime**: session start, turn passing, recovery after a crash, session abort.
//! - **HTTP Handlers**: status codes for commands that are out of turn.

#[cfg(test)]
mod tests {
    use crate::config::CoordinatorConfig;
    use crate::coordinator::{GameEvent, Phase, ViewSnapshot};
    use crate::node::handlers::{handle_finish_turn, handle_ready, handle_view, handle_win};
    use crate::node::protocol::{FinishTurnRequest, StateRequest, default_http_addr};
    use crate::node::service::{NodeHandle, NodeService};
    use crate::topology::store::Topology;
    use crate::topology::types::{Direction, Pid};
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::protocol::{Envelope, Message};
    use crate::transport::Transport;
    use crate::turn::types::{PassKind, SharedState, TurnKind, TurnPass};
    use axum::extract::Extension;
    use axum::http::StatusCode;
    use axum::Json;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::sync::broadcast::error::RecvError;
    use tokio::task::JoinHandle;

    const PATIENCE: Duration = Duration::from_secs(30);

    fn spawn_node(
        network: &Arc<MemoryNetwork>,
        name: &str,
    ) -> (NodeHandle, JoinHandle<anyhow::Result<()>>) {
        let (transport, inbound) = network.join(Pid::from(name));
        NodeService::spawn(
            Pid::from(name),
            CoordinatorConfig::default(),
            Arc::new(transport),
            inbound,
        )
    }

    async fn wait_for_event<F>(events: &mut broadcast::Receiver<GameEvent>, mut matches: F) -> GameEvent
    where
        F: FnMut(&GameEvent) -> bool,
    {
        tokio::time::timeout(PATIENCE, async {
            loop {
                match events.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("node stopped"),
                }
            }
        })
        .await
        .expect("event did not arrive in time")
    }

    async fn wait_for_view<F>(node: &NodeHandle, mut matches: F) -> ViewSnapshot
    where
        F: FnMut(&ViewSnapshot) -> bool,
    {
        let mut view = node.watch_view();

        tokio::time::timeout(PATIENCE, async {
            loop {
                let snapshot = view.borrow_and_update().clone();
                if matches(&snapshot) {
                    return snapshot;
                }
                view.changed().await.expect("node stopped");
            }
        })
        .await
        .expect("view did not reach the expected state in time")
    }

    fn is_turn(event: &GameEvent) -> bool {
        matches!(event, GameEvent::TurnReceived(_))
    }

    /// Spawns `names`, waits for full discovery and readies everyone.
    async fn start_ring(
        network: &Arc<MemoryNetwork>,
        names: &[&str],
    ) -> Vec<(NodeHandle, JoinHandle<anyhow::Result<()>>, broadcast::Receiver<GameEvent>)> {
        let mut nodes = Vec::new();
        for name in names {
            let (handle, task) = spawn_node(network, name);
            let events = handle.subscribe();
            nodes.push((handle, task, events));
        }

        for (handle, _, _) in &nodes {
            wait_for_view(handle, |view| view.players.len() == names.len()).await;
        }
        for (handle, _, _) in &nodes {
            handle.ready_up().unwrap();
        }
        for (handle, _, _) in &nodes {
            wait_for_view(handle, |view| view.phase == Phase::Running).await;
        }

        nodes
    }

    // ============================================================
    // RUNTIME TESTS
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_ring_starts_with_lowest_pid_holding() {
        let network = MemoryNetwork::new();
        let mut nodes = start_ring(&network, &["a", "b", "c"]).await;

        let event = wait_for_event(&mut nodes[0].2, is_turn).await;
        match event {
            GameEvent::TurnReceived(state) => assert_eq!(state.turn_owner, Some(Pid::from("a"))),
            other => panic!("unexpected event {:?}", other),
        }

        let view = wait_for_view(&nodes[1].0, |view| view.leader.is_some()).await;
        assert_eq!(view.leader, Some(Pid::from("a")));
        assert_eq!(view.players.len(), 3);
        assert!(!view.holding_turn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_passes_forward() {
        let network = MemoryNetwork::new();
        let mut nodes = start_ring(&network, &["a", "b", "c"]).await;

        let GameEvent::TurnReceived(state) = wait_for_event(&mut nodes[0].2, is_turn).await else {
            unreachable!()
        };
        nodes[0].0.finish_turn(TurnKind::Normal, state, 0).unwrap();

        let GameEvent::TurnReceived(state) = wait_for_event(&mut nodes[1].2, is_turn).await else {
            unreachable!()
        };
        assert_eq!(state.turn_owner, Some(Pid::from("b")));
        assert_eq!(state.turns_taken, 1);

        let view = wait_for_view(&nodes[0].0, |view| !view.holding_turn).await;
        assert!(!view.holding_turn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_neighbor_checks_adapt_interval() {
        let network = MemoryNetwork::new();
        let nodes = start_ring(&network, &["a", "b", "c"]).await;

        // Memory delivery is instant, so the interval settles at the minimum
        let config = CoordinatorConfig::default();
        let view = wait_for_view(&nodes[0].0, |view| {
            view.check_interval_ms == Some(config.min_interval.as_millis() as u64)
        })
        .await;
        assert_eq!(view.neighbor, Some(Pid::from("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_recovered_after_holder_crash() {
        let network = MemoryNetwork::new();
        let mut nodes = start_ring(&network, &["a", "b", "c"]).await;

        let GameEvent::TurnReceived(state) = wait_for_event(&mut nodes[0].2, is_turn).await else {
            unreachable!()
        };

        // b dies before the turn reaches it
        nodes[1].1.abort();
        network.leave(&Pid::from("b"));
        nodes[0].0.finish_turn(TurnKind::Normal, state, 0).unwrap();

        let GameEvent::TurnReceived(state) = wait_for_event(&mut nodes[2].2, is_turn).await else {
            unreachable!()
        };
        assert_eq!(state.turn_owner, Some(Pid::from("c")));

        let view = wait_for_view(&nodes[2].0, |view| view.players.len() == 2).await;
        assert!(view.failed.contains(&Pid::from("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_turn_aborts_session() {
        let network = MemoryNetwork::new();
        let (harness, mut harness_rx) = network.join(Pid::from("a"));
        let (_node, task) = spawn_node(&network, "b");

        let topology = Topology::build(vec![Pid::from("a"), Pid::from("b")], None).unwrap();
        let pass = |sequence| TurnPass {
            kind: PassKind::Normal,
            state: SharedState::new(Pid::from("b")),
            extra_draw: 0,
            direction: Direction::Forward,
            sequence,
        };

        let messages = vec![
            Message::Topology(topology),
            Message::Turn(pass(1)),
            Message::Turn(pass(2)),
        ];
        for (seq, message) in messages.into_iter().enumerate() {
            let envelope = Envelope {
                from: Pid::from("a"),
                seq: seq as u64 + 1,
                message,
            };
            harness.send_to(&Pid::from("b"), &envelope).await.unwrap();
        }

        let result = tokio::time::timeout(PATIENCE, task)
            .await
            .expect("node kept running")
            .expect("node task panicked");
        assert!(result.is_err());

        // b acknowledged what it accepted before aborting
        let mut acks = 0;
        while let Ok(inbound) = harness_rx.try_recv() {
            if let crate::transport::Inbound::Message(envelope) = inbound
                && envelope.message.is_ack()
            {
                acks += 1;
            }
        }
        assert!(acks >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_win_returns_everyone_to_discovery() {
        let network = MemoryNetwork::new();
        let mut nodes = start_ring(&network, &["a", "b"]).await;

        let GameEvent::TurnReceived(state) = wait_for_event(&mut nodes[0].2, is_turn).await else {
            unreachable!()
        };
        nodes[0].0.declare_win(state).unwrap();

        let event = wait_for_event(&mut nodes[1].2, |event| {
            matches!(event, GameEvent::SessionEnded { .. })
        })
        .await;
        match event {
            GameEvent::SessionEnded { winner, .. } => assert_eq!(winner, Pid::from("a")),
            other => panic!("unexpected event {:?}", other),
        }

        let view = wait_for_view(&nodes[1].0, |view| view.phase == Phase::Discovery).await;
        assert!(view.ready.is_empty());
        assert_eq!(view.players, vec![Pid::from("a"), Pid::from("b")]);
    }

    // ============================================================
    // HTTP HANDLER TESTS
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_finish_turn_rejected_when_not_holding() {
        let network = MemoryNetwork::new();
        let nodes = start_ring(&network, &["a", "b"]).await;
        let b = nodes[1].0.clone();

        let request = FinishTurnRequest {
            kind: TurnKind::Normal,
            data_json: None,
            extra_draw: 0,
        };
        let (status, Json(response)) = handle_finish_turn(Extension(b), Json(request)).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!response.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_turn_rejects_invalid_json() {
        let network = MemoryNetwork::new();
        let mut nodes = start_ring(&network, &["a", "b"]).await;
        wait_for_event(&mut nodes[0].2, is_turn).await;
        let a = nodes[0].0.clone();
        wait_for_view(&a, |view| view.holding_turn).await;

        let request = FinishTurnRequest {
            kind: TurnKind::Normal,
            data_json: Some("{not json".to_string()),
            extra_draw: 0,
        };
        let (status, _) = handle_finish_turn(Extension(a), Json(request)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_turn_over_http_passes_data() {
        let network = MemoryNetwork::new();
        let mut nodes = start_ring(&network, &["a", "b"]).await;
        wait_for_event(&mut nodes[0].2, is_turn).await;
        let a = nodes[0].0.clone();
        wait_for_view(&a, |view| view.holding_turn).await;

        let request = FinishTurnRequest {
            kind: TurnKind::Normal,
            data_json: Some(r#"{"pile":[3]}"#.to_string()),
            extra_draw: 0,
        };
        let (status, Json(response)) = handle_finish_turn(Extension(a), Json(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(response.success);

        let GameEvent::TurnReceived(state) = wait_for_event(&mut nodes[1].2, is_turn).await else {
            unreachable!()
        };
        assert_eq!(state.data_json, r#"{"pile":[3]}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_and_win_rejected_in_wrong_phase() {
        let network = MemoryNetwork::new();
        let (lonely, _task) = spawn_node(&network, "a");

        let (status, _) = handle_win(
            Extension(lonely.clone()),
            Json(StateRequest { data_json: None }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = handle_ready(Extension(lonely.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let Json(view) = handle_view(Extension(lonely)).await;
        assert_eq!(view.me, Pid::from("a"));
        assert_eq!(view.phase, Phase::Discovery);
    }

    #[test]
    fn test_default_http_addr_offsets_bind_port() {
        let bind: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let http = default_http_addr(bind).unwrap();

        assert_eq!(http, "127.0.0.1:6000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_default_http_addr_rejects_high_bind_port() {
        let bind: SocketAddr = "127.0.0.1:65000".parse().unwrap();

        assert!(default_http_addr(bind).is_err());
    }
}
