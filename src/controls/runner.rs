//! Delayed-action scheduling.
//!
//! Actions with an effective delay of zero are dispatched inline; the rest
//! become timers tracked per control. A control is busy while it has at
//! least one pending timer. Aborting cancels local timers only; anything
//! already dispatched to a connection runs to completion.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use super::dispatch::ConnectionDispatch;
use super::redraw::RedrawSink;
use super::types::{ActionInstance, ControlId};

const BUSY_CAPACITY: usize = 256;

/// A control became busy or idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyChange {
    /// The control.
    pub control_id: ControlId,
    /// Whether it now has pending timers.
    pub busy: bool,
}

/// Effective delay of each action, in list order.
///
/// In relative mode each delay is added to the sum of the delays before it;
/// otherwise every action keeps its own delay.
pub fn effective_delays(actions: &[ActionInstance], relative: bool) -> Vec<u64> {
    if !relative {
        return actions.iter().map(|a| a.delay).collect();
    }
    actions
        .iter()
        .scan(0u64, |total, action| {
            *total = total.saturating_add(action.delay);
            Some(*total)
        })
        .collect()
}

/// Runs action lists and tracks delayed actions per control.
pub struct ActionRunner {
    /// Pending timers by control, keyed by timer id.
    timers: Mutex<HashMap<ControlId, HashMap<u64, AbortHandle>>>,
    /// Next timer id.
    next_timer: AtomicU64,
    /// Controls whose next release is skipped.
    skip_release: Mutex<HashSet<ControlId>>,
    /// Busy transitions.
    busy_tx: broadcast::Sender<BusyChange>,
    /// Redraw on busy transitions.
    redraw: Arc<dyn RedrawSink>,
    /// Handle to self for timer tasks.
    weak_self: Weak<ActionRunner>,
}

impl ActionRunner {
    /// Create a runner.
    pub fn new(redraw: Arc<dyn RedrawSink>) -> Arc<Self> {
        let (busy_tx, _) = broadcast::channel(BUSY_CAPACITY);
        Arc::new_cyclic(|weak_self| Self {
            timers: Mutex::new(HashMap::new()),
            next_timer: AtomicU64::new(1),
            skip_release: Mutex::new(HashSet::new()),
            busy_tx,
            redraw,
            weak_self: weak_self.clone(),
        })
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<ControlId, HashMap<u64, AbortHandle>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn skip_release_set(&self) -> MutexGuard<'_, HashSet<ControlId>> {
        self.skip_release.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a list of actions for a control.
    ///
    /// Actions are handled in list order: zero-delay ones are dispatched
    /// immediately, others are scheduled after their effective delay.
    ///
    /// # Arguments
    ///
    /// * `control_id` - Control the actions belong to.
    /// * `actions` - Actions in list order.
    /// * `relative` - Whether delays accumulate down the list.
    /// * `dispatch` - Where to send each action.
    /// * `surface_id` - Surface that triggered the run.
    pub fn run_multiple(
        &self,
        control_id: &ControlId,
        actions: &[ActionInstance],
        relative: bool,
        dispatch: &Arc<dyn ConnectionDispatch>,
        surface_id: Option<&str>,
    ) {
        let delays = effective_delays(actions, relative);
        for (action, delay) in actions.iter().zip(delays) {
            if delay == 0 {
                dispatch.run_action(control_id, action, surface_id);
            } else {
                self.schedule(control_id, action, delay, dispatch, surface_id);
            }
        }
    }

    fn schedule(
        &self,
        control_id: &ControlId,
        action: &ActionInstance,
        delay: u64,
        dispatch: &Arc<dyn ConnectionDispatch>,
        surface_id: Option<&str>,
    ) {
        let timer_id = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let became_busy = {
            let mut timers = self.timers();
            let pending = timers.entry(control_id.clone()).or_default();
            let became_busy = pending.is_empty();

            let runner = self.weak_self.clone();
            let timer_control = control_id.clone();
            let action = action.clone();
            let dispatch = dispatch.clone();
            let surface_id = surface_id.map(str::to_string);
            let task = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let Some(runner) = runner.upgrade() else {
                    return;
                };
                if runner.finish_timer(&timer_control, timer_id) {
                    dispatch.run_action(&timer_control, &action, surface_id.as_deref());
                }
            });
            pending.insert(timer_id, task.abort_handle());
            became_busy
        };
        trace!("Scheduled action {} on {} in {}ms", action.id, control_id, delay);
        if became_busy {
            self.busy_changed(control_id, true);
        }
    }

    /// Remove a fired timer. Returns false when it was aborted meanwhile.
    fn finish_timer(&self, control_id: &ControlId, timer_id: u64) -> bool {
        let (found, now_idle) = {
            let mut timers = self.timers();
            let Some(pending) = timers.get_mut(control_id) else {
                return false;
            };
            let found = pending.remove(&timer_id).is_some();
            let now_idle = found && pending.is_empty();
            if pending.is_empty() {
                timers.remove(control_id);
            }
            (found, now_idle)
        };
        if now_idle {
            self.busy_changed(control_id, false);
        }
        found
    }

    /// Cancel a control's pending timers.
    ///
    /// With `skip_release` the control's next release runs no actions.
    /// Returns the number of timers cancelled.
    pub fn abort_control_delayed(&self, control_id: &ControlId, skip_release: bool) -> usize {
        if skip_release {
            self.skip_release_set().insert(control_id.clone());
        }
        let removed = self.timers().remove(control_id);
        let count = match removed {
            Some(pending) => {
                let count = pending.len();
                for handle in pending.into_values() {
                    handle.abort();
                }
                count
            }
            None => 0,
        };
        if count > 0 {
            debug!("Aborted {} delayed actions on {}", count, control_id);
            self.busy_changed(control_id, false);
        }
        count
    }

    /// Cancel every pending timer of every control.
    pub fn abort_all(&self) -> usize {
        let drained: Vec<(ControlId, HashMap<u64, AbortHandle>)> = self.timers().drain().collect();
        let mut count = 0;
        for (control_id, pending) in drained {
            count += pending.len();
            for handle in pending.into_values() {
                handle.abort();
            }
            self.busy_changed(&control_id, false);
        }
        if count > 0 {
            debug!("Aborted {} delayed actions", count);
        }
        count
    }

    /// Consume the skip-release flag of a control.
    pub fn take_skip_release(&self, control_id: &ControlId) -> bool {
        self.skip_release_set().remove(control_id)
    }

    /// Clear the skip-release flag of a control.
    pub fn clear_skip_release(&self, control_id: &ControlId) {
        self.skip_release_set().remove(control_id);
    }

    /// Whether a control has pending timers.
    pub fn is_busy(&self, control_id: &ControlId) -> bool {
        self.timers()
            .get(control_id)
            .is_some_and(|pending| !pending.is_empty())
    }

    /// Pending timers of a control.
    pub fn pending_count(&self, control_id: &ControlId) -> usize {
        self.timers().get(control_id).map_or(0, HashMap::len)
    }

    /// Subscribe to busy transitions.
    pub fn subscribe_busy(&self) -> broadcast::Receiver<BusyChange> {
        self.busy_tx.subscribe()
    }

    fn busy_changed(&self, control_id: &ControlId, busy: bool) {
        self.redraw.redraw(control_id);
        let _ = self.busy_tx.send(BusyChange {
            control_id: control_id.clone(),
            busy,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::dispatch::LearnFuture;
    use crate::controls::redraw::BroadcastRedraw;
    use crate::controls::types::FeedbackInstance;
    use serde_json::Map;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Recorder {
        runs: Mutex<Vec<(String, Instant)>>,
    }

    impl Recorder {
        fn ids(&self) -> Vec<String> {
            self.runs.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
        }
    }

    impl ConnectionDispatch for Recorder {
        fn run_action(&self, _control_id: &ControlId, action: &ActionInstance, _surface_id: Option<&str>) {
            self.runs
                .lock()
                .unwrap()
                .push((action.action_type.clone(), Instant::now()));
        }
        fn action_changed(&self, _: &ControlId, _: &ActionInstance) {}
        fn action_removed(&self, _: &ControlId, _: &ActionInstance) {}
        fn feedback_changed(&self, _: &ControlId, _: &FeedbackInstance) {}
        fn feedback_removed(&self, _: &ControlId, _: &FeedbackInstance) {}
        fn learn_action(&self, _: &ControlId, _: &ActionInstance) -> LearnFuture {
            Box::pin(async { None })
        }
        fn learn_feedback(&self, _: &ControlId, _: &FeedbackInstance) -> LearnFuture {
            Box::pin(async { None })
        }
    }

    fn action(name: &str, delay: u64) -> ActionInstance {
        let mut action = ActionInstance::new("osc-1", name, Map::new());
        action.delay = delay;
        action
    }

    fn setup() -> (Arc<ActionRunner>, Arc<Recorder>, Arc<dyn ConnectionDispatch>) {
        let runner = ActionRunner::new(Arc::new(BroadcastRedraw::new()));
        let recorder = Arc::new(Recorder::default());
        let dispatch: Arc<dyn ConnectionDispatch> = recorder.clone();
        (runner, recorder, dispatch)
    }

    #[test]
    fn test_relative_and_absolute_delays() {
        let actions = vec![action("a", 100), action("b", 50), action("c", 200)];
        assert_eq!(effective_delays(&actions, true), vec![100, 150, 350]);
        assert_eq!(effective_delays(&actions, false), vec![100, 50, 200]);
        assert!(effective_delays(&[], true).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_runs_inline() {
        let (runner, recorder, dispatch) = setup();
        let control = ControlId::new("c1");

        runner.run_multiple(&control, &[action("a", 0), action("b", 0)], false, &dispatch, None);

        assert_eq!(recorder.ids(), vec!["a", "b"]);
        assert!(!runner.is_busy(&control));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_actions_fire_in_order() {
        let (runner, recorder, dispatch) = setup();
        let control = ControlId::new("c1");
        let start = Instant::now();

        runner.run_multiple(
            &control,
            &[action("a", 100), action("b", 50), action("c", 200)],
            true,
            &dispatch,
            None,
        );
        assert!(runner.is_busy(&control));
        assert_eq!(runner.pending_count(&control), 3);

        tokio::time::sleep(Duration::from_millis(400)).await;

        let runs = recorder.runs.lock().unwrap().clone();
        let offsets: Vec<u128> = runs
            .iter()
            .map(|(_, at)| at.duration_since(start).as_millis())
            .collect();
        assert_eq!(
            runs.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(offsets, vec![100, 150, 350]);
        assert!(!runner.is_busy(&control));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_before_fire_dispatches_nothing() {
        let (runner, recorder, dispatch) = setup();
        let control = ControlId::new("c1");
        let mut busy = runner.subscribe_busy();

        runner.run_multiple(&control, &[action("a", 100), action("b", 200)], false, &dispatch, None);
        assert_eq!(runner.abort_control_delayed(&control, false), 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(recorder.ids().is_empty());
        assert!(!runner.is_busy(&control));

        assert!(busy.recv().await.unwrap().busy);
        assert!(!busy.recv().await.unwrap().busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_all_only_cancels_timers() {
        let (runner, recorder, dispatch) = setup();
        let c1 = ControlId::new("c1");
        let c2 = ControlId::new("c2");

        runner.run_multiple(&c1, &[action("now", 0), action("later", 100)], false, &dispatch, None);
        runner.run_multiple(&c2, &[action("later2", 100)], false, &dispatch, None);
        assert_eq!(runner.abort_all(), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.ids(), vec!["now"]);
    }

    #[test]
    fn test_skip_release_flag() {
        let runner = ActionRunner::new(Arc::new(BroadcastRedraw::new()));
        let control = ControlId::new("c1");

        assert!(!runner.take_skip_release(&control));
        runner.abort_control_delayed(&control, true);
        assert!(runner.take_skip_release(&control));
        assert!(!runner.take_skip_release(&control));

        runner.abort_control_delayed(&control, true);
        runner.clear_skip_release(&control);
        assert!(!runner.take_skip_release(&control));
    }
}
