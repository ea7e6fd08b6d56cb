//! Control state machine.
//!
//! A control owns its action sets, feedback list, base style and the
//! transient state derived from them: pushed flag, current step, cached
//! feedback values and last resolved connection status. Mutations that a
//! connection must hear about are pushed through the dispatcher as they
//! happen.
//!
//! ```text
//!   press(true) ──► kind? ── page nav ──► PageController
//!                    │
//!                    ├─ button ──► "down" set ──► ActionRunner
//!                    └─ step ────► current step set, then advance
//! ```

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::dispatch::ConnectionDispatch;
use super::error::ControlError;
use super::runner::ActionRunner;
use super::types::{
    ActionInstance, ActionSetId, ButtonStyle, ControlConfig, ControlId, ControlKind,
    ControlOptions, FeedbackInstance, PersistedControl,
};
use crate::connections::INTERNAL_CONNECTION_ID;
use crate::definitions::{DefinitionsRegistry, FeedbackKind};
use crate::host::StatusCategory;
use crate::internal::PageController;
use crate::ipc::protocol::{ActionWire, FeedbackWire, UpgradedItemsMessage};
use crate::variables::VariableStore;

/// Collaborators a control needs while handling input.
pub struct ControlContext<'a> {
    /// Where action and feedback work goes.
    pub dispatch: &'a Arc<dyn ConnectionDispatch>,
    /// Delayed-action scheduling.
    pub runner: &'a ActionRunner,
    /// Page navigation.
    pub pages: &'a dyn PageController,
}

/// Step indicator drawn on stepped controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepIndicator {
    /// Position of the current step, starting at 1.
    pub current: usize,
    /// Number of steps.
    pub count: usize,
}

/// Everything the graphics collaborator needs to draw a control.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrawStyle {
    /// Control kind.
    pub kind: ControlKind,
    /// Base style with feedback overrides applied and variables substituted.
    pub style: Map<String, Value>,
    /// Whether the control is held down.
    pub pushed: bool,
    /// Whether delayed actions are pending.
    pub action_running: bool,
    /// Worst status of the connections the control uses.
    pub status: StatusCategory,
    /// Step indicator of stepped controls.
    pub step: Option<StepIndicator>,
    /// Current page, for page number controls.
    pub page: Option<u32>,
}

/// Shallow merge: every key of `overlay` replaces the one in `base`.
pub fn merge_style(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        base.insert(key.clone(), value.clone());
    }
}

/// One button-like control.
#[derive(Debug, Clone)]
pub struct Control {
    id: ControlId,
    kind: ControlKind,
    config: ControlConfig,
    action_sets: BTreeMap<ActionSetId, Vec<ActionInstance>>,
    feedbacks: Vec<FeedbackInstance>,
    pushed: bool,
    current_step: ActionSetId,
    feedback_values: HashMap<String, Value>,
    status: StatusCategory,
}

impl Control {
    /// Create an empty control.
    pub fn new(id: ControlId, kind: ControlKind) -> Self {
        let mut action_sets = BTreeMap::new();
        match kind {
            ControlKind::Press => {
                action_sets.insert(ActionSetId::Down, Vec::new());
                action_sets.insert(ActionSetId::Up, Vec::new());
            }
            ControlKind::Step => {
                action_sets.insert(ActionSetId::Step(0), Vec::new());
            }
            ControlKind::PageUp | ControlKind::PageNumber | ControlKind::PageDown => {}
        }
        Self {
            id,
            kind,
            config: ControlConfig::default(),
            action_sets,
            feedbacks: Vec::new(),
            pushed: false,
            current_step: ActionSetId::Step(0),
            feedback_values: HashMap::new(),
            status: StatusCategory::Good,
        }
    }

    /// Restore a control from its persisted shape.
    ///
    /// Action sets that do not fit the kind are dropped, button controls
    /// always have `down` and `up`, stepped controls always have a step and
    /// start on the first one.
    pub fn from_persisted(id: ControlId, persisted: PersistedControl) -> Self {
        let mut control = Self::new(id, persisted.kind);
        control.config = persisted.config;
        control.feedbacks = persisted.feedbacks;
        let kind = control.kind;
        let sets: BTreeMap<ActionSetId, Vec<ActionInstance>> = persisted
            .action_sets
            .into_iter()
            .filter(|(set, _)| set_fits_kind(*set, kind))
            .collect();
        match kind {
            ControlKind::Press => control.action_sets.extend(sets),
            ControlKind::Step if !sets.is_empty() => control.action_sets = sets,
            _ => {}
        }
        if let Some(first) = control.action_sets.keys().next().copied() {
            control.current_step = first;
        }
        control
    }

    /// Persisted shape.
    pub fn to_persisted(&self) -> PersistedControl {
        PersistedControl {
            kind: self.kind,
            config: self.config.clone(),
            feedbacks: self.feedbacks.clone(),
            action_sets: self.action_sets.clone(),
        }
    }

    /// Control id.
    pub fn id(&self) -> &ControlId {
        &self.id
    }

    /// Control kind.
    pub fn kind(&self) -> ControlKind {
        self.kind
    }

    /// Base style.
    pub fn style(&self) -> &ButtonStyle {
        &self.config.style
    }

    /// Behaviour switches.
    pub fn options(&self) -> &ControlOptions {
        &self.config.options
    }

    /// Whether the control is held down.
    pub fn is_pushed(&self) -> bool {
        self.pushed
    }

    /// Current step of a stepped control.
    pub fn current_step(&self) -> Option<ActionSetId> {
        (self.kind == ControlKind::Step).then_some(self.current_step)
    }

    /// Actions of one set.
    pub fn action_set(&self, set: ActionSetId) -> Option<&[ActionInstance]> {
        self.action_sets.get(&set).map(Vec::as_slice)
    }

    /// Ids of every action set, sorted.
    pub fn action_set_ids(&self) -> Vec<ActionSetId> {
        self.action_sets.keys().copied().collect()
    }

    /// Feedbacks in evaluation order.
    pub fn feedbacks(&self) -> &[FeedbackInstance] {
        &self.feedbacks
    }

    /// Cached value of a feedback.
    pub fn feedback_value(&self, feedback_id: &str) -> Option<&Value> {
        self.feedback_values.get(feedback_id)
    }

    /// Last resolved connection status.
    pub fn status(&self) -> StatusCategory {
        self.status
    }

    /// Replace the base style.
    pub fn set_style(&mut self, style: ButtonStyle) {
        self.config.style = style;
    }

    /// Replace the behaviour switches.
    pub fn set_options(&mut self, options: ControlOptions) {
        if self.kind == ControlKind::Press && options.rotary_actions {
            self.action_sets.entry(ActionSetId::RotateLeft).or_default();
            self.action_sets.entry(ActionSetId::RotateRight).or_default();
        }
        self.config.options = options;
    }

    /// Handle a press or release.
    ///
    /// Returns false when the transition was a duplicate and ignored.
    pub fn press(&mut self, pressed: bool, surface_id: Option<&str>, ctx: &ControlContext<'_>) -> bool {
        if self.pushed == pressed {
            return false;
        }
        self.pushed = pressed;

        match self.kind {
            ControlKind::PageUp => {
                if pressed {
                    ctx.pages.inc_page();
                }
            }
            ControlKind::PageDown => {
                if pressed {
                    ctx.pages.dec_page();
                }
            }
            ControlKind::PageNumber => {
                if pressed {
                    ctx.pages.set_page(1);
                }
            }
            ControlKind::Press => {
                let set = if pressed {
                    ctx.runner.clear_skip_release(&self.id);
                    Some(ActionSetId::Down)
                } else if ctx.runner.take_skip_release(&self.id) {
                    debug!("Skipping release actions of {}", self.id);
                    None
                } else {
                    Some(ActionSetId::Up)
                };
                if let Some(set) = set {
                    self.run_set(set, surface_id, ctx);
                }
            }
            ControlKind::Step => {
                if pressed {
                    ctx.runner.clear_skip_release(&self.id);
                    let step = self.current_step;
                    if self.config.options.step_auto_progress {
                        self.advance_step();
                    }
                    self.run_set(step, surface_id, ctx);
                } else {
                    ctx.runner.take_skip_release(&self.id);
                }
            }
        }
        true
    }

    /// Handle an encoder rotation.
    ///
    /// Returns true when a rotate set was run.
    pub fn rotate(&mut self, right: bool, surface_id: Option<&str>, ctx: &ControlContext<'_>) -> bool {
        if self.kind != ControlKind::Press || !self.config.options.rotary_actions {
            return false;
        }
        let set = if right {
            ActionSetId::RotateRight
        } else {
            ActionSetId::RotateLeft
        };
        self.run_set(set, surface_id, ctx);
        true
    }

    fn run_set(&self, set: ActionSetId, surface_id: Option<&str>, ctx: &ControlContext<'_>) {
        let Some(actions) = self.action_sets.get(&set) else {
            return;
        };
        if actions.is_empty() {
            return;
        }
        debug!("Running {} actions of set '{}' on {}", actions.len(), set, self.id);
        ctx.runner.run_multiple(
            &self.id,
            actions,
            self.config.options.relative_delay,
            ctx.dispatch,
            surface_id,
        );
    }

    fn advance_step(&mut self) {
        let next = self
            .action_sets
            .range((
                std::ops::Bound::Excluded(self.current_step),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .or_else(|| self.action_sets.iter().next())
            .map(|(id, _)| *id);
        if let Some(next) = next {
            self.current_step = next;
        }
    }

    fn check_set(&self, set: ActionSetId) -> Result<(), ControlError> {
        if !self.kind.has_actions() {
            return Err(ControlError::NoActions(self.kind));
        }
        if !set_fits_kind(set, self.kind) {
            return Err(ControlError::InvalidActionSet {
                set,
                kind: self.kind,
            });
        }
        Ok(())
    }

    fn set_mut(&mut self, set: ActionSetId) -> Result<&mut Vec<ActionInstance>, ControlError> {
        self.check_set(set)?;
        self.action_sets
            .get_mut(&set)
            .ok_or(ControlError::UnknownActionSet(set))
    }

    fn action_mut(
        &mut self,
        set: ActionSetId,
        action_id: &str,
    ) -> Result<&mut ActionInstance, ControlError> {
        self.set_mut(set)?
            .iter_mut()
            .find(|a| a.id == action_id)
            .ok_or_else(|| ControlError::UnknownAction(action_id.to_string()))
    }

    /// Append an action to a set and subscribe it.
    ///
    /// Rotate sets of button controls are created on first use.
    pub fn add_action(
        &mut self,
        set: ActionSetId,
        action: ActionInstance,
        dispatch: &Arc<dyn ConnectionDispatch>,
    ) -> Result<(), ControlError> {
        self.check_set(set)?;
        if self.kind == ControlKind::Press {
            self.action_sets.entry(set).or_default();
        }
        dispatch.action_changed(&self.id, &action);
        self.set_mut(set)?.push(action);
        Ok(())
    }

    /// Remove an action and unsubscribe it.
    pub fn remove_action(
        &mut self,
        set: ActionSetId,
        action_id: &str,
        dispatch: &Arc<dyn ConnectionDispatch>,
    ) -> Result<ActionInstance, ControlError> {
        let actions = self.set_mut(set)?;
        let index = actions
            .iter()
            .position(|a| a.id == action_id)
            .ok_or_else(|| ControlError::UnknownAction(action_id.to_string()))?;
        let action = actions.remove(index);
        dispatch.action_removed(&self.id, &action);
        Ok(action)
    }

    /// Move an action within its set. The index is clamped.
    pub fn reorder_action(
        &mut self,
        set: ActionSetId,
        action_id: &str,
        new_index: usize,
    ) -> Result<(), ControlError> {
        let actions = self.set_mut(set)?;
        let index = actions
            .iter()
            .position(|a| a.id == action_id)
            .ok_or_else(|| ControlError::UnknownAction(action_id.to_string()))?;
        let action = actions.remove(index);
        let new_index = new_index.min(actions.len());
        actions.insert(new_index, action);
        Ok(())
    }

    /// Set one option of an action.
    pub fn set_action_option(
        &mut self,
        set: ActionSetId,
        action_id: &str,
        key: &str,
        value: Value,
        dispatch: &Arc<dyn ConnectionDispatch>,
    ) -> Result<(), ControlError> {
        let id = self.id.clone();
        let action = self.action_mut(set, action_id)?;
        action.options.insert(key.to_string(), value);
        dispatch.action_changed(&id, action);
        Ok(())
    }

    /// Replace every option of an action.
    pub fn set_action_options(
        &mut self,
        set: ActionSetId,
        action_id: &str,
        options: Map<String, Value>,
        dispatch: &Arc<dyn ConnectionDispatch>,
    ) -> Result<(), ControlError> {
        let id = self.id.clone();
        let action = self.action_mut(set, action_id)?;
        action.options = options;
        dispatch.action_changed(&id, action);
        Ok(())
    }

    /// Set the user-entered delay of an action.
    pub fn set_action_delay(
        &mut self,
        set: ActionSetId,
        action_id: &str,
        delay: u64,
    ) -> Result<(), ControlError> {
        self.action_mut(set, action_id)?.delay = delay;
        Ok(())
    }

    /// Find an action in any set.
    pub fn find_action(&self, action_id: &str) -> Option<(ActionSetId, &ActionInstance)> {
        self.action_sets.iter().find_map(|(set, actions)| {
            actions
                .iter()
                .find(|a| a.id == action_id)
                .map(|action| (*set, action))
        })
    }

    fn feedback_mut(&mut self, feedback_id: &str) -> Result<&mut FeedbackInstance, ControlError> {
        self.feedbacks
            .iter_mut()
            .find(|f| f.id == feedback_id)
            .ok_or_else(|| ControlError::UnknownFeedback(feedback_id.to_string()))
    }

    /// Find a feedback.
    pub fn find_feedback(&self, feedback_id: &str) -> Option<&FeedbackInstance> {
        self.feedbacks.iter().find(|f| f.id == feedback_id)
    }

    /// Append a feedback and subscribe it.
    pub fn add_feedback(&mut self, feedback: FeedbackInstance, dispatch: &Arc<dyn ConnectionDispatch>) {
        dispatch.feedback_changed(&self.id, &feedback);
        self.feedbacks.push(feedback);
    }

    /// Remove a feedback, unsubscribe it and drop its cached value.
    pub fn remove_feedback(
        &mut self,
        feedback_id: &str,
        dispatch: &Arc<dyn ConnectionDispatch>,
    ) -> Result<FeedbackInstance, ControlError> {
        let index = self
            .feedbacks
            .iter()
            .position(|f| f.id == feedback_id)
            .ok_or_else(|| ControlError::UnknownFeedback(feedback_id.to_string()))?;
        let feedback = self.feedbacks.remove(index);
        self.feedback_values.remove(&feedback.id);
        dispatch.feedback_removed(&self.id, &feedback);
        Ok(feedback)
    }

    /// Move a feedback. The index is clamped.
    pub fn reorder_feedback(&mut self, feedback_id: &str, new_index: usize) -> Result<(), ControlError> {
        let index = self
            .feedbacks
            .iter()
            .position(|f| f.id == feedback_id)
            .ok_or_else(|| ControlError::UnknownFeedback(feedback_id.to_string()))?;
        let feedback = self.feedbacks.remove(index);
        let new_index = new_index.min(self.feedbacks.len());
        self.feedbacks.insert(new_index, feedback);
        Ok(())
    }

    /// Set one option of a feedback and resubscribe it.
    pub fn set_feedback_option(
        &mut self,
        feedback_id: &str,
        key: &str,
        value: Value,
        dispatch: &Arc<dyn ConnectionDispatch>,
    ) -> Result<(), ControlError> {
        let id = self.id.clone();
        let feedback = self.feedback_mut(feedback_id)?;
        feedback.options.insert(key.to_string(), value);
        dispatch.feedback_changed(&id, feedback);
        Ok(())
    }

    /// Replace every option of a feedback and resubscribe it.
    pub fn set_feedback_options(
        &mut self,
        feedback_id: &str,
        options: Map<String, Value>,
        dispatch: &Arc<dyn ConnectionDispatch>,
    ) -> Result<(), ControlError> {
        let id = self.id.clone();
        let feedback = self.feedback_mut(feedback_id)?;
        feedback.options = options;
        dispatch.feedback_changed(&id, feedback);
        Ok(())
    }

    /// Set one key of a boolean feedback's style override.
    ///
    /// The override starts from the definition's default style. A `null`
    /// value removes the key.
    pub fn set_feedback_style_value(
        &mut self,
        feedback_id: &str,
        key: &str,
        value: Value,
        definitions: &DefinitionsRegistry,
    ) -> Result<(), ControlError> {
        let feedback = self.feedback_mut(feedback_id)?;
        let definition =
            definitions.feedback_definition(&feedback.connection_id, &feedback.feedback_type);
        if definition
            .as_ref()
            .is_some_and(|def| def.kind != FeedbackKind::Boolean)
        {
            return Err(ControlError::NotBoolean(feedback_id.to_string()));
        }
        let style = feedback.style.get_or_insert_with(|| {
            definition
                .and_then(|def| def.default_style)
                .unwrap_or_default()
        });
        if value.is_null() {
            style.remove(key);
        } else {
            style.insert(key.to_string(), value);
        }
        Ok(())
    }

    /// Invert or un-invert a boolean feedback.
    pub fn set_feedback_inverted(
        &mut self,
        feedback_id: &str,
        inverted: bool,
        dispatch: &Arc<dyn ConnectionDispatch>,
    ) -> Result<(), ControlError> {
        let id = self.id.clone();
        let feedback = self.feedback_mut(feedback_id)?;
        feedback.is_inverted = inverted;
        dispatch.feedback_changed(&id, feedback);
        Ok(())
    }

    /// Add a step after the highest one.
    pub fn add_step(&mut self) -> Result<ActionSetId, ControlError> {
        if self.kind != ControlKind::Step {
            return Err(ControlError::InvalidActionSet {
                set: ActionSetId::Step(0),
                kind: self.kind,
            });
        }
        let next = self
            .action_sets
            .keys()
            .filter_map(|set| match set {
                ActionSetId::Step(n) => Some(n + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        let step = ActionSetId::Step(next);
        self.action_sets.insert(step, Vec::new());
        Ok(step)
    }

    /// Remove a step and unsubscribe its actions. The last step stays.
    pub fn remove_step(
        &mut self,
        step: ActionSetId,
        dispatch: &Arc<dyn ConnectionDispatch>,
    ) -> Result<(), ControlError> {
        self.set_mut(step)?;
        if self.action_sets.len() <= 1 {
            return Err(ControlError::LastStep);
        }
        if let Some(actions) = self.action_sets.remove(&step) {
            for action in &actions {
                dispatch.action_removed(&self.id, action);
            }
        }
        if self.current_step == step
            && let Some(first) = self.action_sets.keys().next()
        {
            self.current_step = *first;
        }
        Ok(())
    }

    /// Jump to a step.
    pub fn set_current_step(&mut self, step: ActionSetId) -> Result<(), ControlError> {
        self.set_mut(step)?;
        self.current_step = step;
        Ok(())
    }

    /// Merge feedback values pushed by a connection.
    ///
    /// Only feedbacks owned by `connection_id` are updated. Returns true
    /// when at least one cached value changed.
    pub fn update_feedback_values<'a>(
        &mut self,
        connection_id: &str,
        values: impl IntoIterator<Item = (&'a str, &'a Value)>,
    ) -> bool {
        let mut changed = false;
        for (feedback_id, value) in values {
            let owned = self
                .feedbacks
                .iter()
                .any(|f| f.id == feedback_id && f.connection_id == connection_id);
            if !owned {
                continue;
            }
            if self.feedback_values.get(feedback_id) != Some(value) {
                self.feedback_values
                    .insert(feedback_id.to_string(), value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Compute the style to draw.
    ///
    /// # Arguments
    ///
    /// * `definitions` - Feedback types, to tell boolean from advanced.
    /// * `variables` - Substitutes `$(label:name)` references in the text.
    /// * `action_running` - Whether delayed actions are pending.
    /// * `current_page` - Shown by page number controls.
    pub fn draw_style(
        &self,
        definitions: &DefinitionsRegistry,
        variables: &dyn VariableStore,
        action_running: bool,
        current_page: u32,
    ) -> DrawStyle {
        let mut style = match serde_json::to_value(&self.config.style) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };

        for feedback in &self.feedbacks {
            let Some(value) = self.feedback_values.get(&feedback.id) else {
                continue;
            };
            let definition =
                definitions.feedback_definition(&feedback.connection_id, &feedback.feedback_type);
            let is_boolean = match &definition {
                Some(def) => def.kind == FeedbackKind::Boolean,
                None => value.is_boolean(),
            };

            if is_boolean {
                let active = value.as_bool().unwrap_or(false) != feedback.is_inverted;
                if !active {
                    continue;
                }
                let overlay = feedback
                    .style
                    .as_ref()
                    .or_else(|| definition.as_ref().and_then(|def| def.default_style.as_ref()));
                if let Some(overlay) = overlay {
                    merge_style(&mut style, overlay);
                }
            } else if let Value::Object(overlay) = value {
                merge_style(&mut style, overlay);
            }
        }

        if let Some(Value::String(text)) = style.get("text")
            && text.contains("$(")
        {
            let parsed = variables.parse(text);
            style.insert("text".to_string(), Value::String(parsed.text));
        }

        let step = (self.kind == ControlKind::Step).then(|| StepIndicator {
            current: self
                .action_sets
                .keys()
                .position(|set| *set == self.current_step)
                .map_or(1, |i| i + 1),
            count: self.action_sets.len(),
        });

        DrawStyle {
            kind: self.kind,
            style,
            pushed: self.pushed,
            action_running,
            status: self.status,
            step,
            page: (self.kind == ControlKind::PageNumber).then_some(current_page),
        }
    }

    /// Connections referenced by actions and feedbacks, without `internal`.
    pub fn connection_ids(&self) -> BTreeSet<&str> {
        self.action_sets
            .values()
            .flatten()
            .map(|a| a.connection_id.as_str())
            .chain(self.feedbacks.iter().map(|f| f.connection_id.as_str()))
            .filter(|id| *id != INTERNAL_CONNECTION_ID)
            .collect()
    }

    /// Whether any instance belongs to a connection.
    pub fn references_connection(&self, connection_id: &str) -> bool {
        self.action_sets
            .values()
            .flatten()
            .any(|a| a.connection_id == connection_id)
            || self.feedbacks.iter().any(|f| f.connection_id == connection_id)
    }

    /// Recompute the status from the connections the control uses.
    ///
    /// Returns true when it changed.
    pub fn check_status(&mut self, status: &crate::host::StatusTracker) -> bool {
        let worst = status.worst_of(self.connection_ids());
        if worst == self.status {
            return false;
        }
        self.status = worst;
        true
    }

    /// Remove every instance owned by a connection, unsubscribing each first.
    pub fn prune_connection(&mut self, connection_id: &str, dispatch: &Arc<dyn ConnectionDispatch>) -> usize {
        self.prune_where(|id| id == connection_id, dispatch)
    }

    /// Remove every instance whose connection is not known.
    pub fn prune_unknown(
        &mut self,
        is_known: impl Fn(&str) -> bool,
        dispatch: &Arc<dyn ConnectionDispatch>,
    ) -> usize {
        self.prune_where(|id| id != INTERNAL_CONNECTION_ID && !is_known(id), dispatch)
    }

    fn prune_where(
        &mut self,
        matches: impl Fn(&str) -> bool,
        dispatch: &Arc<dyn ConnectionDispatch>,
    ) -> usize {
        let mut removed = 0;
        for actions in self.action_sets.values_mut() {
            actions.retain(|action| {
                if matches(&action.connection_id) {
                    dispatch.action_removed(&self.id, action);
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        let mut dropped = Vec::new();
        self.feedbacks.retain(|feedback| {
            if matches(&feedback.connection_id) {
                dispatch.feedback_removed(&self.id, feedback);
                dropped.push(feedback.id.clone());
                false
            } else {
                true
            }
        });
        for id in &dropped {
            self.feedback_values.remove(id);
        }
        removed + dropped.len()
    }

    /// Subscribe every instance, used after loading.
    pub fn subscribe_all(&self, dispatch: &Arc<dyn ConnectionDispatch>) {
        for action in self.action_sets.values().flatten() {
            dispatch.action_changed(&self.id, action);
        }
        for feedback in &self.feedbacks {
            dispatch.feedback_changed(&self.id, feedback);
        }
    }

    /// Unsubscribe every instance, used before removal.
    pub fn unsubscribe_all(&self, dispatch: &Arc<dyn ConnectionDispatch>) {
        for action in self.action_sets.values().flatten() {
            dispatch.action_removed(&self.id, action);
        }
        for feedback in &self.feedbacks {
            dispatch.feedback_removed(&self.id, feedback);
        }
    }

    /// Actions owned by a connection, in the form sent to it.
    pub fn actions_for_connection(&self, connection_id: &str) -> Vec<ActionWire> {
        self.action_sets
            .values()
            .flatten()
            .filter(|a| a.connection_id == connection_id)
            .map(|a| a.to_wire(&self.id))
            .collect()
    }

    /// Feedbacks owned by a connection, in the form sent to it.
    pub fn feedbacks_for_connection(&self, connection_id: &str) -> Vec<FeedbackWire> {
        self.feedbacks
            .iter()
            .filter(|f| f.connection_id == connection_id)
            .map(|f| f.to_wire(&self.id))
            .collect()
    }

    /// Internal feedbacks of this control.
    pub fn internal_feedbacks(&self) -> impl Iterator<Item = &FeedbackInstance> {
        self.feedbacks
            .iter()
            .filter(|f| f.connection_id == INTERNAL_CONNECTION_ID)
    }

    /// Apply instances rewritten by a connection's upgrade scripts.
    ///
    /// Only instances on this control owned by `connection_id` change.
    /// Returns true when anything changed.
    pub fn apply_upgraded_items(&mut self, connection_id: &str, items: &UpgradedItemsMessage) -> bool {
        let mut changed = false;
        for wire in items.actions.iter().filter(|w| w.control_id == self.id.as_str()) {
            if let Some(action) = self
                .action_sets
                .values_mut()
                .flatten()
                .find(|a| a.id == wire.id && a.connection_id == connection_id)
            {
                action.action_type = wire.action_type.clone();
                action.options = wire.options.clone();
                changed = true;
            }
        }
        for wire in items.feedbacks.iter().filter(|w| w.control_id == self.id.as_str()) {
            if let Some(feedback) = self
                .feedbacks
                .iter_mut()
                .find(|f| f.id == wire.id && f.connection_id == connection_id)
            {
                feedback.feedback_type = wire.feedback_type.clone();
                feedback.options = wire.options.clone();
                feedback.is_inverted = wire.is_inverted;
                changed = true;
            }
        }
        changed
    }
}

/// Whether an action set belongs on a kind of control.
fn set_fits_kind(set: ActionSetId, kind: ControlKind) -> bool {
    match kind {
        ControlKind::Press => !matches!(set, ActionSetId::Step(_)),
        ControlKind::Step => matches!(set, ActionSetId::Step(_)),
        ControlKind::PageUp | ControlKind::PageNumber | ControlKind::PageDown => false,
    }
}
