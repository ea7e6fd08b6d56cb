//! Control store.
//!
//! Owns every control by id plus a grid index by location. All input and
//! editing goes through here so each change can be followed by a status
//! check and a redraw signal. The store is also the [`ControlBridge`] the
//! connection host uses to reach controls.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use super::control::{Control, ControlContext, DrawStyle};
use super::dispatch::ConnectionDispatch;
use super::error::ControlError;
use super::redraw::RedrawSink;
use super::runner::ActionRunner;
use super::types::{
    ActionInstance, ActionSetId, ButtonStyle, ControlId, ControlKind, ControlOptions,
    FeedbackInstance, Location, PersistedControl,
};
use crate::connections::{ConnectionRegistry, INTERNAL_CONNECTION_ID};
use crate::definitions::DefinitionsRegistry;
use crate::host::{ControlBridge, StatusTracker};
use crate::internal::{InternalModule, PageController};
use crate::ipc::protocol::{ActionWire, FeedbackValueUpdate, FeedbackWire, UpgradedItemsMessage};
use crate::variables::VariableStore;
use serde_json::Value;

/// Everything the store depends on.
#[derive(Clone)]
pub struct ControlServices {
    /// Delayed-action scheduling.
    pub runner: Arc<ActionRunner>,
    /// Where instance work goes.
    pub dispatch: Arc<dyn ConnectionDispatch>,
    /// Published catalogs.
    pub definitions: Arc<DefinitionsRegistry>,
    /// Connection status.
    pub status: Arc<StatusTracker>,
    /// Variable values.
    pub variables: Arc<dyn VariableStore>,
    /// Page navigation.
    pub pages: Arc<dyn PageController>,
    /// Redraw signals.
    pub redraw: Arc<dyn RedrawSink>,
    /// The `internal` connection.
    pub internal: Arc<InternalModule>,
    /// Connection configuration, for orphan cleanup.
    pub registry: Arc<dyn ConnectionRegistry>,
}

#[derive(Default)]
struct Arena {
    by_id: HashMap<ControlId, Control>,
    locations: HashMap<Location, ControlId>,
}

impl Arena {
    fn get_mut(&mut self, id: &ControlId) -> Result<&mut Control, ControlError> {
        self.by_id
            .get_mut(id)
            .ok_or_else(|| ControlError::UnknownControl(id.clone()))
    }
}

/// Every control, by id and by location.
pub struct ControlStore {
    arena: Mutex<Arena>,
    services: ControlServices,
}

impl ControlStore {
    /// Create an empty store.
    pub fn new(services: ControlServices) -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
            services,
        }
    }

    fn arena(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self) -> ControlContext<'_> {
        ControlContext {
            dispatch: &self.services.dispatch,
            runner: &self.services.runner,
            pages: &*self.services.pages,
        }
    }

    /// Run `f` on one control, then re-check its status and redraw.
    fn edit<R>(
        &self,
        control_id: &ControlId,
        f: impl FnOnce(&mut Control, &ControlContext<'_>) -> Result<R, ControlError>,
    ) -> Result<R, ControlError> {
        let result = {
            let mut arena = self.arena();
            let control = arena.get_mut(control_id)?;
            let result = f(control, &self.context())?;
            control.check_status(&self.services.status);
            result
        };
        self.services.redraw.redraw(control_id);
        Ok(result)
    }

    fn insert(&self, control: Control, location: Option<Location>) {
        let id = control.id().clone();
        let mut arena = self.arena();
        if let Some(location) = location
            && let Some(previous) = arena.locations.insert(location, id.clone())
            && previous != id
        {
            debug!("Control {} replaces {} at {:?}", id, previous, location);
        }
        arena.by_id.insert(id, control);
    }

    /// Create an empty control, optionally placing it on the grid.
    pub fn create_control(&self, kind: ControlKind, location: Option<Location>) -> ControlId {
        let id = ControlId::generate();
        self.insert(Control::new(id.clone(), kind), location);
        self.services.redraw.redraw(&id);
        id
    }

    /// Restore a persisted control and subscribe its instances.
    pub fn load_control(&self, id: ControlId, persisted: PersistedControl, location: Option<Location>) {
        let mut control = Control::from_persisted(id.clone(), persisted);
        control.subscribe_all(&self.services.dispatch);
        control.check_status(&self.services.status);
        self.insert(control, location);
        self.refresh_internal_for(&id);
        self.services.redraw.redraw(&id);
    }

    /// Remove a control, cancelling its timers and unsubscribing its instances.
    pub fn remove_control(&self, control_id: &ControlId) -> Result<(), ControlError> {
        let control = {
            let mut arena = self.arena();
            let control = arena
                .by_id
                .remove(control_id)
                .ok_or_else(|| ControlError::UnknownControl(control_id.clone()))?;
            arena.locations.retain(|_, id| id != control_id);
            control
        };
        self.services.runner.abort_control_delayed(control_id, false);
        self.services.runner.clear_skip_release(control_id);
        control.unsubscribe_all(&self.services.dispatch);
        self.services.redraw.redraw(control_id);
        Ok(())
    }

    /// Control at a grid location.
    pub fn control_at(&self, location: Location) -> Option<ControlId> {
        self.arena().locations.get(&location).cloned()
    }

    /// Move a control to a location. Returns the control that was there.
    pub fn place(&self, control_id: &ControlId, location: Location) -> Result<Option<ControlId>, ControlError> {
        let mut arena = self.arena();
        if !arena.by_id.contains_key(control_id) {
            return Err(ControlError::UnknownControl(control_id.clone()));
        }
        arena.locations.retain(|_, id| id != control_id);
        Ok(arena.locations.insert(location, control_id.clone()))
    }

    /// Ids of every control.
    pub fn control_ids(&self) -> Vec<ControlId> {
        let mut ids: Vec<_> = self.arena().by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of controls.
    pub fn len(&self) -> usize {
        self.arena().by_id.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kind of a control.
    pub fn kind(&self, control_id: &ControlId) -> Option<ControlKind> {
        self.arena().by_id.get(control_id).map(Control::kind)
    }

    /// Current step of a stepped control.
    pub fn current_step(&self, control_id: &ControlId) -> Option<ActionSetId> {
        self.arena()
            .by_id
            .get(control_id)
            .and_then(Control::current_step)
    }

    /// Press or release a control.
    ///
    /// Returns false for a duplicate transition.
    pub fn press_control(
        &self,
        control_id: &ControlId,
        pressed: bool,
        surface_id: Option<&str>,
    ) -> Result<bool, ControlError> {
        self.edit(control_id, |control, ctx| Ok(control.press(pressed, surface_id, ctx)))
    }

    /// Press or release whatever is at a location. Empty locations are ignored.
    pub fn press_location(
        &self,
        location: Location,
        pressed: bool,
        surface_id: Option<&str>,
    ) -> Result<bool, ControlError> {
        match self.control_at(location) {
            Some(id) => self.press_control(&id, pressed, surface_id),
            None => Ok(false),
        }
    }

    /// Rotate an encoder bound to a control.
    pub fn rotate_control(
        &self,
        control_id: &ControlId,
        right: bool,
        surface_id: Option<&str>,
    ) -> Result<bool, ControlError> {
        self.edit(control_id, |control, ctx| Ok(control.rotate(right, surface_id, ctx)))
    }

    /// Replace a control's base style.
    pub fn set_style(&self, control_id: &ControlId, style: ButtonStyle) -> Result<(), ControlError> {
        self.edit(control_id, |control, _| {
            control.set_style(style);
            Ok(())
        })
    }

    /// Replace a control's behaviour switches.
    pub fn set_options(&self, control_id: &ControlId, options: ControlOptions) -> Result<(), ControlError> {
        self.edit(control_id, |control, _| {
            control.set_options(options);
            Ok(())
        })
    }

    /// Add an action with its type's default options.
    ///
    /// Returns the new action's id.
    pub fn add_action(
        &self,
        control_id: &ControlId,
        set: ActionSetId,
        connection_id: &str,
        action_type: &str,
    ) -> Result<String, ControlError> {
        let options = self
            .services
            .definitions
            .default_action_options(connection_id, action_type)
            .unwrap_or_default();
        let action = ActionInstance::new(connection_id, action_type, options);
        let id = action.id.clone();
        self.edit(control_id, |control, ctx| control.add_action(set, action, ctx.dispatch))?;
        Ok(id)
    }

    /// Remove an action.
    pub fn remove_action(
        &self,
        control_id: &ControlId,
        set: ActionSetId,
        action_id: &str,
    ) -> Result<(), ControlError> {
        self.edit(control_id, |control, ctx| {
            control.remove_action(set, action_id, ctx.dispatch).map(|_| ())
        })
    }

    /// Move an action within its set.
    pub fn reorder_action(
        &self,
        control_id: &ControlId,
        set: ActionSetId,
        action_id: &str,
        new_index: usize,
    ) -> Result<(), ControlError> {
        self.edit(control_id, |control, _| control.reorder_action(set, action_id, new_index))
    }

    /// Set one option of an action.
    pub fn set_action_option(
        &self,
        control_id: &ControlId,
        set: ActionSetId,
        action_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), ControlError> {
        self.edit(control_id, |control, ctx| {
            control.set_action_option(set, action_id, key, value, ctx.dispatch)
        })
    }

    /// Set the delay of an action in milliseconds.
    pub fn set_action_delay(
        &self,
        control_id: &ControlId,
        set: ActionSetId,
        action_id: &str,
        delay: u64,
    ) -> Result<(), ControlError> {
        self.edit(control_id, |control, _| control.set_action_delay(set, action_id, delay))
    }

    /// Add a feedback with its type's default options.
    ///
    /// Returns the new feedback's id.
    pub fn add_feedback(
        &self,
        control_id: &ControlId,
        connection_id: &str,
        feedback_type: &str,
    ) -> Result<String, ControlError> {
        let options = self
            .services
            .definitions
            .default_feedback_options(connection_id, feedback_type)
            .unwrap_or_default();
        let feedback = FeedbackInstance::new(connection_id, feedback_type, options);
        let id = feedback.id.clone();
        self.edit(control_id, |control, ctx| {
            control.add_feedback(feedback, ctx.dispatch);
            Ok(())
        })?;
        if connection_id == INTERNAL_CONNECTION_ID {
            self.refresh_internal_for(control_id);
        }
        Ok(id)
    }

    /// Remove a feedback.
    pub fn remove_feedback(&self, control_id: &ControlId, feedback_id: &str) -> Result<(), ControlError> {
        self.edit(control_id, |control, ctx| {
            control.remove_feedback(feedback_id, ctx.dispatch).map(|_| ())
        })
    }

    /// Move a feedback. Later feedbacks win on conflicting style keys.
    pub fn reorder_feedback(
        &self,
        control_id: &ControlId,
        feedback_id: &str,
        new_index: usize,
    ) -> Result<(), ControlError> {
        self.edit(control_id, |control, _| control.reorder_feedback(feedback_id, new_index))
    }

    /// Set one option of a feedback.
    pub fn set_feedback_option(
        &self,
        control_id: &ControlId,
        feedback_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), ControlError> {
        self.edit(control_id, |control, ctx| {
            control.set_feedback_option(feedback_id, key, value, ctx.dispatch)
        })?;
        self.refresh_internal_for(control_id);
        Ok(())
    }

    /// Set one key of a boolean feedback's style override.
    pub fn set_feedback_style_value(
        &self,
        control_id: &ControlId,
        feedback_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), ControlError> {
        let definitions = &self.services.definitions;
        self.edit(control_id, |control, _| {
            control.set_feedback_style_value(feedback_id, key, value, definitions)
        })
    }

    /// Invert or un-invert a boolean feedback.
    pub fn set_feedback_inverted(
        &self,
        control_id: &ControlId,
        feedback_id: &str,
        inverted: bool,
    ) -> Result<(), ControlError> {
        self.edit(control_id, |control, ctx| {
            control.set_feedback_inverted(feedback_id, inverted, ctx.dispatch)
        })
    }

    /// Add a step to a stepped control.
    pub fn add_step(&self, control_id: &ControlId) -> Result<ActionSetId, ControlError> {
        self.edit(control_id, |control, _| control.add_step())
    }

    /// Remove a step. The last step cannot be removed.
    pub fn remove_step(&self, control_id: &ControlId, step: ActionSetId) -> Result<(), ControlError> {
        self.edit(control_id, |control, ctx| control.remove_step(step, ctx.dispatch))
    }

    /// Jump to a step.
    pub fn set_current_step(&self, control_id: &ControlId, step: ActionSetId) -> Result<(), ControlError> {
        self.edit(control_id, |control, _| control.set_current_step(step))
    }

    /// Ask the owning connection for an action's current options.
    ///
    /// Returns true when options were learned and applied.
    pub async fn learn_action_options(
        &self,
        control_id: &ControlId,
        action_id: &str,
    ) -> Result<bool, ControlError> {
        let (set, action) = {
            let arena = self.arena();
            let control = arena
                .by_id
                .get(control_id)
                .ok_or_else(|| ControlError::UnknownControl(control_id.clone()))?;
            let (set, action) = control
                .find_action(action_id)
                .ok_or_else(|| ControlError::UnknownAction(action_id.to_string()))?;
            (set, action.clone())
        };

        let Some(options) = self.services.dispatch.learn_action(control_id, &action).await else {
            debug!("Nothing learned for action {} on {}", action_id, control_id);
            return Ok(false);
        };
        self.edit(control_id, |control, ctx| {
            control.set_action_options(set, action_id, options, ctx.dispatch)
        })?;
        Ok(true)
    }

    /// Ask the owning connection for a feedback's current options.
    ///
    /// Returns true when options were learned and applied.
    pub async fn learn_feedback_options(
        &self,
        control_id: &ControlId,
        feedback_id: &str,
    ) -> Result<bool, ControlError> {
        let feedback = {
            let arena = self.arena();
            let control = arena
                .by_id
                .get(control_id)
                .ok_or_else(|| ControlError::UnknownControl(control_id.clone()))?;
            control
                .find_feedback(feedback_id)
                .cloned()
                .ok_or_else(|| ControlError::UnknownFeedback(feedback_id.to_string()))?
        };

        let Some(options) = self.services.dispatch.learn_feedback(control_id, &feedback).await else {
            debug!("Nothing learned for feedback {} on {}", feedback_id, control_id);
            return Ok(false);
        };
        self.edit(control_id, |control, ctx| {
            control.set_feedback_options(feedback_id, options, ctx.dispatch)
        })?;
        Ok(true)
    }

    /// Style to draw for a control.
    pub fn draw_style(&self, control_id: &ControlId) -> Result<DrawStyle, ControlError> {
        let arena = self.arena();
        let control = arena
            .by_id
            .get(control_id)
            .ok_or_else(|| ControlError::UnknownControl(control_id.clone()))?;
        Ok(control.draw_style(
            &self.services.definitions,
            &*self.services.variables,
            self.services.runner.is_busy(control_id),
            self.services.pages.current_page(),
        ))
    }

    /// Persisted shape of a control.
    pub fn to_persisted(&self, control_id: &ControlId) -> Result<PersistedControl, ControlError> {
        self.arena()
            .by_id
            .get(control_id)
            .map(Control::to_persisted)
            .ok_or_else(|| ControlError::UnknownControl(control_id.clone()))
    }

    /// Persisted shape of every control.
    pub fn export_all(&self) -> BTreeMap<ControlId, PersistedControl> {
        self.arena()
            .by_id
            .iter()
            .map(|(id, control)| (id.clone(), control.to_persisted()))
            .collect()
    }

    /// Re-check the status of every control using a connection.
    ///
    /// Returns the number of controls whose status changed.
    pub fn connection_status_changed(&self, connection_id: &str) -> usize {
        let changed: Vec<ControlId> = {
            let mut arena = self.arena();
            arena
                .by_id
                .values_mut()
                .filter(|control| control.references_connection(connection_id))
                .filter_map(|control| {
                    control
                        .check_status(&self.services.status)
                        .then(|| control.id().clone())
                })
                .collect()
        };
        for id in &changed {
            self.services.redraw.redraw(id);
        }
        changed.len()
    }

    /// Re-evaluate every internal feedback.
    ///
    /// Returns the number of controls whose values changed.
    pub fn refresh_internal_feedbacks(&self) -> usize {
        let changed: Vec<ControlId> = {
            let mut arena = self.arena();
            arena
                .by_id
                .values_mut()
                .filter_map(|control| {
                    self.evaluate_internal(control)
                        .then(|| control.id().clone())
                })
                .collect()
        };
        for id in &changed {
            self.services.redraw.redraw(id);
        }
        changed.len()
    }

    fn refresh_internal_for(&self, control_id: &ControlId) {
        let changed = {
            let mut arena = self.arena();
            match arena.by_id.get_mut(control_id) {
                Some(control) => self.evaluate_internal(control),
                None => false,
            }
        };
        if changed {
            self.services.redraw.redraw(control_id);
        }
    }

    fn evaluate_internal(&self, control: &mut Control) -> bool {
        let values: Vec<(String, Value)> = control
            .internal_feedbacks()
            .filter_map(|feedback| {
                self.services
                    .internal
                    .evaluate_feedback(control.id(), feedback)
                    .map(|value| (feedback.id.clone(), value))
            })
            .collect();
        if values.is_empty() {
            return false;
        }
        control.update_feedback_values(
            INTERNAL_CONNECTION_ID,
            values.iter().map(|(id, value)| (id.as_str(), value)),
        )
    }

    /// Redraw controls whose text references any of the changed variables.
    ///
    /// Returns the number of controls redrawn.
    pub fn variables_changed(&self, names: &[String]) -> usize {
        if names.is_empty() {
            return 0;
        }
        let names: HashSet<&str> = names.iter().map(String::as_str).collect();
        let affected: Vec<ControlId> = {
            let arena = self.arena();
            arena
                .by_id
                .values()
                .filter(|control| {
                    let text = &control.style().text;
                    text.contains("$(")
                        && self
                            .services
                            .variables
                            .parse(text)
                            .variable_ids
                            .iter()
                            .any(|id| names.contains(id.as_str()))
                })
                .map(|control| control.id().clone())
                .collect()
        };
        for id in &affected {
            self.services.redraw.redraw(id);
        }
        affected.len()
    }

    /// Remove instances of connections that are no longer configured.
    ///
    /// Returns the number of instances removed.
    pub fn cleanup_orphans(&self) -> usize {
        let registry = &self.services.registry;
        let (removed, touched) = {
            let mut arena = self.arena();
            let mut removed = 0;
            let mut touched = Vec::new();
            for control in arena.by_id.values_mut() {
                let n = control.prune_unknown(|id| registry.get(id).is_some(), &self.services.dispatch);
                if n > 0 {
                    control.check_status(&self.services.status);
                    touched.push(control.id().clone());
                    removed += n;
                }
            }
            (removed, touched)
        };
        if removed > 0 {
            info!("Removed {} orphaned instances from {} controls", removed, touched.len());
        }
        for id in &touched {
            self.services.redraw.redraw(id);
        }
        removed
    }
}

impl ControlBridge for ControlStore {
    fn actions_for_connection(&self, connection_id: &str) -> Vec<ActionWire> {
        self.arena()
            .by_id
            .values()
            .flat_map(|control| control.actions_for_connection(connection_id))
            .collect()
    }

    fn feedbacks_for_connection(&self, connection_id: &str) -> Vec<FeedbackWire> {
        self.arena()
            .by_id
            .values()
            .flat_map(|control| control.feedbacks_for_connection(connection_id))
            .collect()
    }

    fn update_feedback_values(&self, connection_id: &str, values: Vec<FeedbackValueUpdate>) -> usize {
        let mut by_control: HashMap<ControlId, Vec<(String, Value)>> = HashMap::new();
        for update in values {
            by_control
                .entry(ControlId::new(update.control_id))
                .or_default()
                .push((update.id, update.value));
        }

        let changed: Vec<ControlId> = {
            let mut arena = self.arena();
            by_control
                .into_iter()
                .filter_map(|(control_id, values)| {
                    let control = arena.by_id.get_mut(&control_id)?;
                    control
                        .update_feedback_values(
                            connection_id,
                            values.iter().map(|(id, value)| (id.as_str(), value)),
                        )
                        .then_some(control_id)
                })
                .collect()
        };
        for id in &changed {
            self.services.redraw.redraw(id);
        }
        changed.len()
    }

    fn apply_upgraded_items(&self, connection_id: &str, items: UpgradedItemsMessage) {
        let changed: Vec<ControlId> = {
            let mut arena = self.arena();
            arena
                .by_id
                .values_mut()
                .filter_map(|control| {
                    control
                        .apply_upgraded_items(connection_id, &items)
                        .then(|| control.id().clone())
                })
                .collect()
        };
        for id in &changed {
            self.services.redraw.redraw(id);
        }
    }

    fn prune_connection(&self, connection_id: &str) -> usize {
        let (removed, touched) = {
            let mut arena = self.arena();
            let mut removed = 0;
            let mut touched = Vec::new();
            for control in arena.by_id.values_mut() {
                let n = control.prune_connection(connection_id, &self.services.dispatch);
                if n > 0 {
                    control.check_status(&self.services.status);
                    touched.push(control.id().clone());
                    removed += n;
                }
            }
            (removed, touched)
        };
        for id in &touched {
            self.services.redraw.redraw(id);
        }
        removed
    }
}
