//! Control runtime behaviour against a recording dispatcher.
//!
//! Actions owned by real connections are recorded with the virtual time
//! they fire at; actions owned by `internal` are executed by the real
//! internal module so timer aborts and page changes take effect.

use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use surface_host::connections::{
    ConnectionConfig, INTERNAL_CONNECTION_ID, MemoryConnectionRegistry,
};
use surface_host::controls::{
    ActionInstance, ActionRunner, ActionSetId, BroadcastRedraw, ConnectionDispatch, ControlId,
    ControlKind, ControlOptions, ControlServices, ControlStore, FeedbackInstance, LearnFuture,
};
use surface_host::definitions::DefinitionsRegistry;
use surface_host::host::{ControlBridge, StatusTracker};
use surface_host::internal::{InternalModule, PageController, SimplePages};
use surface_host::ipc::protocol::FeedbackValueUpdate;
use surface_host::variables::MemoryVariables;
use tokio::time::Instant;

struct RecordingDispatch {
    internal: Arc<InternalModule>,
    started: Instant,
    runs: Mutex<Vec<(String, u128)>>,
    changes: Mutex<Vec<String>>,
}

impl RecordingDispatch {
    fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    fn timed_runs(&self) -> Vec<(String, u128)> {
        self.runs.lock().unwrap().clone()
    }

    fn take_changes(&self) -> Vec<String> {
        std::mem::take(&mut *self.changes.lock().unwrap())
    }
}

impl ConnectionDispatch for RecordingDispatch {
    fn run_action(&self, control_id: &ControlId, action: &ActionInstance, surface_id: Option<&str>) {
        if action.connection_id == INTERNAL_CONNECTION_ID {
            self.internal.execute_action(control_id, action, surface_id);
            return;
        }
        let at = self.started.elapsed().as_millis();
        self.runs.lock().unwrap().push((action.action_type.clone(), at));
    }

    fn action_changed(&self, _: &ControlId, action: &ActionInstance) {
        self.changes.lock().unwrap().push(format!("update {}", action.action_type));
    }

    fn action_removed(&self, _: &ControlId, action: &ActionInstance) {
        self.changes.lock().unwrap().push(format!("delete {}", action.action_type));
    }

    fn feedback_changed(&self, _: &ControlId, feedback: &FeedbackInstance) {
        self.changes.lock().unwrap().push(format!("subscribe {}", feedback.feedback_type));
    }

    fn feedback_removed(&self, _: &ControlId, feedback: &FeedbackInstance) {
        self.changes.lock().unwrap().push(format!("unsubscribe {}", feedback.feedback_type));
    }

    fn learn_action(&self, _: &ControlId, _: &ActionInstance) -> LearnFuture {
        Box::pin(async { None })
    }

    fn learn_feedback(&self, _: &ControlId, _: &FeedbackInstance) -> LearnFuture {
        Box::pin(async { None })
    }
}

struct Runtime {
    store: ControlStore,
    dispatch: Arc<RecordingDispatch>,
    runner: Arc<ActionRunner>,
    pages: Arc<SimplePages>,
    redraw: Arc<BroadcastRedraw>,
}

fn connection(id: &str, label: &str) -> ConnectionConfig {
    ConnectionConfig {
        id: id.to_string(),
        instance_type: "generic-osc".to_string(),
        label: label.to_string(),
        enabled: true,
        config: json!({}),
        last_upgrade_index: None,
    }
}

fn runtime() -> Runtime {
    let redraw = Arc::new(BroadcastRedraw::new());
    let runner = ActionRunner::new(redraw.clone());
    let status = Arc::new(StatusTracker::new());
    let pages = Arc::new(SimplePages::new(10));
    let definitions = Arc::new(DefinitionsRegistry::new());
    InternalModule::register(&definitions);
    let internal = Arc::new(InternalModule::new(pages.clone(), runner.clone(), status.clone()));
    let dispatch = Arc::new(RecordingDispatch {
        internal: internal.clone(),
        started: Instant::now(),
        runs: Mutex::new(Vec::new()),
        changes: Mutex::new(Vec::new()),
    });
    let registry = Arc::new(MemoryConnectionRegistry::new([
        connection("osc-1", "osc1"),
        connection("osc-2", "osc2"),
    ]));

    let store = ControlStore::new(ControlServices {
        runner: runner.clone(),
        dispatch: dispatch.clone(),
        definitions,
        status,
        variables: Arc::new(MemoryVariables::new()),
        pages: pages.clone(),
        redraw: redraw.clone(),
        internal,
        registry,
    });
    Runtime {
        store,
        dispatch,
        runner,
        pages,
        redraw,
    }
}

fn add_delayed(rt: &Runtime, control: &ControlId, set: ActionSetId, action_type: &str, delay: u64) -> String {
    let id = rt.store.add_action(control, set, "osc-1", action_type).unwrap();
    rt.store.set_action_delay(control, set, &id, delay).unwrap();
    id
}

/// Order must match exactly; times may round up by a tick.
fn assert_fired(runs: &[(String, u128)], expected: &[(&str, u128)]) {
    let types: Vec<&str> = runs.iter().map(|(t, _)| t.as_str()).collect();
    let expected_types: Vec<&str> = expected.iter().map(|(t, _)| *t).collect();
    assert_eq!(types, expected_types);
    for ((action, at), (_, want)) in runs.iter().zip(expected) {
        assert!(
            *at >= *want && *at <= want + 1,
            "{} fired at {}ms, expected {}ms",
            action,
            at,
            want
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_press_then_release_runs_down_then_up() {
    let rt = runtime();
    let control = rt.store.create_control(ControlKind::Press, None);
    rt.store.add_action(&control, ActionSetId::Down, "osc-1", "a").unwrap();
    rt.store.add_action(&control, ActionSetId::Down, "osc-1", "b").unwrap();
    rt.store.add_action(&control, ActionSetId::Up, "osc-1", "c").unwrap();

    assert!(rt.store.press_control(&control, true, None).unwrap());
    assert_eq!(rt.dispatch.runs(), vec!["a", "b"]);

    // A repeated press is not a transition.
    assert!(!rt.store.press_control(&control, true, None).unwrap());

    assert!(rt.store.press_control(&control, false, None).unwrap());
    assert_eq!(rt.dispatch.runs(), vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_relative_delays_accumulate() {
    let rt = runtime();
    let control = rt.store.create_control(ControlKind::Press, None);
    rt.store
        .set_options(
            &control,
            ControlOptions {
                relative_delay: true,
                ..ControlOptions::default()
            },
        )
        .unwrap();
    add_delayed(&rt, &control, ActionSetId::Down, "a", 100);
    add_delayed(&rt, &control, ActionSetId::Down, "b", 50);
    add_delayed(&rt, &control, ActionSetId::Down, "c", 200);

    rt.store.press_control(&control, true, None).unwrap();
    assert!(rt.runner.is_busy(&control));
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_fired(&rt.dispatch.timed_runs(), &[("a", 100), ("b", 150), ("c", 350)]);
    assert!(!rt.runner.is_busy(&control));
}

#[tokio::test(start_paused = true)]
async fn test_absolute_delays_are_independent() {
    let rt = runtime();
    let control = rt.store.create_control(ControlKind::Press, None);
    add_delayed(&rt, &control, ActionSetId::Down, "a", 100);
    add_delayed(&rt, &control, ActionSetId::Down, "b", 50);
    add_delayed(&rt, &control, ActionSetId::Down, "c", 200);

    rt.store.press_control(&control, true, None).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_fired(&rt.dispatch.timed_runs(), &[("b", 50), ("a", 100), ("c", 200)]);
}

#[tokio::test(start_paused = true)]
async fn test_step_control_cycles_and_wraps() {
    let rt = runtime();
    let control = rt.store.create_control(ControlKind::Step, None);
    let one = rt.store.add_step(&control).unwrap();
    let two = rt.store.add_step(&control).unwrap();
    assert_eq!((one, two), (ActionSetId::Step(1), ActionSetId::Step(2)));

    rt.store.add_action(&control, ActionSetId::Step(0), "osc-1", "s0").unwrap();
    rt.store.add_action(&control, one, "osc-1", "s1").unwrap();
    rt.store.add_action(&control, two, "osc-1", "s2").unwrap();

    for _ in 0..4 {
        rt.store.press_control(&control, true, None).unwrap();
        rt.store.press_control(&control, false, None).unwrap();
    }
    assert_eq!(rt.dispatch.runs(), vec!["s0", "s1", "s2", "s0"]);
    assert_eq!(rt.store.current_step(&control), Some(ActionSetId::Step(1)));
}

#[tokio::test(start_paused = true)]
async fn test_abort_control_delayed_before_fire() {
    let rt = runtime();
    let target = rt.store.create_control(ControlKind::Press, None);
    add_delayed(&rt, &target, ActionSetId::Down, "late", 100);
    add_delayed(&rt, &target, ActionSetId::Down, "later", 200);

    let stop = rt.store.create_control(ControlKind::Press, None);
    let abort = rt
        .store
        .add_action(&stop, ActionSetId::Down, INTERNAL_CONNECTION_ID, "abort_control_delayed")
        .unwrap();
    rt.store
        .set_action_option(&stop, ActionSetId::Down, &abort, "control", json!(target.to_string()))
        .unwrap();

    rt.store.press_control(&target, true, None).unwrap();
    assert_eq!(rt.runner.pending_count(&target), 2);
    rt.store.press_control(&stop, true, None).unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rt.dispatch.runs().is_empty());
    assert!(!rt.runner.is_busy(&target));
}

#[tokio::test(start_paused = true)]
async fn test_abort_with_skip_release_suppresses_up() {
    let rt = runtime();
    let control = rt.store.create_control(ControlKind::Press, None);
    add_delayed(&rt, &control, ActionSetId::Down, "late", 100);
    let abort = rt
        .store
        .add_action(&control, ActionSetId::Down, INTERNAL_CONNECTION_ID, "abort_control_delayed")
        .unwrap();
    rt.store
        .set_action_option(&control, ActionSetId::Down, &abort, "skip_release", json!(true))
        .unwrap();
    rt.store.add_action(&control, ActionSetId::Up, "osc-1", "up").unwrap();

    rt.store.press_control(&control, true, None).unwrap();
    rt.store.press_control(&control, false, None).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rt.dispatch.runs().is_empty());

    // The flag only covers one release.
    rt.store.remove_action(&control, ActionSetId::Down, &abort).unwrap();
    rt.store.press_control(&control, true, None).unwrap();
    rt.store.press_control(&control, false, None).unwrap();
    assert_eq!(rt.dispatch.runs(), vec!["up"]);
}

#[tokio::test(start_paused = true)]
async fn test_abort_all_delayed_cancels_every_control() {
    let rt = runtime();
    let a = rt.store.create_control(ControlKind::Press, None);
    let b = rt.store.create_control(ControlKind::Press, None);
    add_delayed(&rt, &a, ActionSetId::Down, "a", 100);
    add_delayed(&rt, &b, ActionSetId::Down, "b", 100);

    let panic = rt.store.create_control(ControlKind::Press, None);
    rt.store
        .add_action(&panic, ActionSetId::Down, INTERNAL_CONNECTION_ID, "abort_all_delayed")
        .unwrap();

    rt.store.press_control(&a, true, None).unwrap();
    rt.store.press_control(&b, true, None).unwrap();
    rt.store.press_control(&panic, true, None).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rt.dispatch.runs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_page_controls_never_run_actions() {
    let rt = runtime();
    let up = rt.store.create_control(ControlKind::PageUp, None);
    let down = rt.store.create_control(ControlKind::PageDown, None);

    rt.store.press_control(&up, true, None).unwrap();
    assert_eq!(rt.pages.current_page(), 2);
    rt.store.press_control(&down, true, None).unwrap();
    rt.store.press_control(&down, false, None).unwrap();
    rt.store.press_control(&down, true, None).unwrap();
    assert_eq!(rt.pages.current_page(), 10);
    assert!(rt.dispatch.runs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_identical_feedback_value_does_not_redraw() {
    let rt = runtime();
    let control = rt.store.create_control(ControlKind::Press, None);
    let feedback = rt.store.add_feedback(&control, "osc-1", "state").unwrap();
    let mut redraws = rt.redraw.subscribe();

    let update = || {
        vec![FeedbackValueUpdate {
            id: feedback.clone(),
            control_id: control.to_string(),
            value: json!({ "bgcolor": 255 }),
        }]
    };
    assert_eq!(rt.store.update_feedback_values("osc-1", update()), 1);
    assert_eq!(redraws.recv().await.unwrap(), control);

    assert_eq!(rt.store.update_feedback_values("osc-1", update()), 0);
    assert!(redraws.try_recv().is_err());

    // Values from another connection are ignored.
    assert_eq!(rt.store.update_feedback_values("osc-2", update()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deleting_connection_prunes_only_its_instances() {
    let rt = runtime();
    let a = rt.store.create_control(ControlKind::Press, None);
    let b = rt.store.create_control(ControlKind::Step, None);
    rt.store.add_action(&a, ActionSetId::Down, "osc-1", "one").unwrap();
    rt.store.add_action(&a, ActionSetId::Down, "osc-2", "two").unwrap();
    rt.store.add_feedback(&a, "osc-1", "state").unwrap();
    rt.store.add_action(&b, ActionSetId::Step(0), "osc-1", "three").unwrap();
    rt.store.add_action(&b, ActionSetId::Step(0), INTERNAL_CONNECTION_ID, "inc_page").unwrap();
    rt.dispatch.take_changes();

    assert_eq!(rt.store.prune_connection("osc-1"), 3);

    let mut changes = rt.dispatch.take_changes();
    changes.sort();
    assert_eq!(changes, vec!["delete one", "delete three", "unsubscribe state"]);

    let a = rt.store.to_persisted(&a).unwrap();
    assert_eq!(a.action_sets[&ActionSetId::Down].len(), 1);
    assert_eq!(a.action_sets[&ActionSetId::Down][0].connection_id, "osc-2");
    assert!(a.feedbacks.is_empty());
    let b = rt.store.to_persisted(&b).unwrap();
    assert_eq!(b.action_sets[&ActionSetId::Step(0)].len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_orphans_keeps_configured_and_internal() {
    let rt = runtime();
    let control = rt.store.create_control(ControlKind::Press, None);
    rt.store.add_action(&control, ActionSetId::Down, "osc-1", "kept").unwrap();
    rt.store.add_action(&control, ActionSetId::Down, "ghost", "gone").unwrap();
    rt.store.add_action(&control, ActionSetId::Up, INTERNAL_CONNECTION_ID, "inc_page").unwrap();
    rt.store.add_feedback(&control, "ghost", "state").unwrap();

    assert_eq!(rt.store.cleanup_orphans(), 2);
    assert_eq!(rt.store.cleanup_orphans(), 0);

    let persisted = rt.store.to_persisted(&control).unwrap();
    let down: Vec<&str> = persisted.action_sets[&ActionSetId::Down]
        .iter()
        .map(|a| a.action_type.as_str())
        .collect();
    assert_eq!(down, vec!["kept"]);
    assert_eq!(persisted.action_sets[&ActionSetId::Up].len(), 1);
    assert!(persisted.feedbacks.is_empty());
}
