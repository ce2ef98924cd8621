use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use pipette_rs::actions::{Action, PauseAction, PlayAction, QueueCommandAction};
use pipette_rs::{EngineError, StateStore};
use pipette_shared::command::HomeParams;
use pipette_shared::config::EngineConfig;
use pipette_shared::{Command, CommandParams, CommandRequest};

fn queue_home(store: &StateStore) -> Command {
    let command = Command::create(CommandRequest::new(CommandParams::Home(HomeParams {})), Utc::now()).unwrap();
    store.handle_action(&Action::QueueCommand(QueueCommandAction {
        command: command.clone(),
    }));
    command
}

#[tokio::test]
async fn test_waiters_before_and_after_the_action_both_resolve() {
    let store = Arc::new(StateStore::new(&EngineConfig::default()));

    let early = tokio::spawn({
        let store = store.clone();
        async move { store.wait_for(|state| Ok((!state.commands().is_empty()).then_some(()))).await }
    });
    tokio::task::yield_now().await;

    let command = queue_home(&store);
    early.await.unwrap().unwrap();

    let found = store
        .wait_for(|state| Ok(state.commands().get(&command.id).map(|c| c.id.clone())))
        .await
        .unwrap();
    assert_eq!(found, command.id);
}

#[tokio::test]
async fn test_many_waiters_see_latest_snapshot() {
    let store = Arc::new(StateStore::new(&EngineConfig::default()));
    let waiters = (1..=10u64).map(|threshold| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .wait_for(move |state| Ok((state.version() >= threshold).then_some(state.version())))
                .await
        })
    });
    let waiters: Vec<_> = waiters.collect();
    tokio::task::yield_now().await;

    // Land every action before any waiter gets to run again.
    for _ in 0..10 {
        queue_home(&store);
    }

    let seen = join_all(waiters).await;
    for (threshold, version) in (1..=10u64).zip(seen) {
        let version = version.unwrap().unwrap();
        assert!(version >= threshold);
        assert_eq!(version, 10);
    }
}

#[tokio::test]
async fn test_predicate_error_goes_to_its_caller_only() {
    let store = Arc::new(StateStore::new(&EngineConfig::default()));
    let failing = tokio::spawn({
        let store = store.clone();
        async move {
            store
                .wait_for(|state| {
                    if state.version() > 0 {
                        Err(EngineError::CommandNotFound("missing".to_string()))
                    } else {
                        Ok(None::<()>)
                    }
                })
                .await
        }
    });
    let healthy = tokio::spawn({
        let store = store.clone();
        async move { store.wait_for(|state| Ok((state.version() >= 2).then_some(()))).await }
    });
    tokio::task::yield_now().await;

    queue_home(&store);
    let error = failing.await.unwrap().unwrap_err();
    assert!(matches!(error, EngineError::CommandNotFound(_)));

    queue_home(&store);
    healthy.await.unwrap().unwrap();
    assert_eq!(store.state().commands().len(), 2);
}

#[tokio::test]
async fn test_wait_for_timeout_is_a_distinct_error() {
    let store = StateStore::new(&EngineConfig::default());
    let result = store
        .wait_for_timeout(|_| Ok(None::<()>), Duration::from_millis(20))
        .await;
    assert!(matches!(result, Err(EngineError::WaitTimeout(d)) if d == Duration::from_millis(20)));
}

#[tokio::test]
async fn test_every_action_bumps_the_version() {
    let store = StateStore::new(&EngineConfig::default());
    let mut receiver = store.subscribe();
    store.handle_action(&Action::Play(PlayAction { requested_at: Utc::now() }));
    store.handle_action(&Action::Pause(PauseAction));
    // A pause while already paused changes nothing but still counts.
    store.handle_action(&Action::Pause(PauseAction));
    assert!(receiver.has_changed().unwrap());
    assert_eq!(receiver.borrow_and_update().version(), 3);
    assert_eq!(store.version(), 3);
}

#[tokio::test]
async fn test_commands_keep_enqueue_order() {
    let store = StateStore::new(&EngineConfig::default());
    let ids: Vec<_> = (0..5).map(|_| queue_home(&store).id).collect();
    let state = store.state();
    let listed: Vec<_> = state.commands().get_all().into_iter().map(|c| c.id).collect();
    assert_eq!(listed, ids);
    assert_eq!(state.commands().index_of(&ids[3]), Some(3));
}
