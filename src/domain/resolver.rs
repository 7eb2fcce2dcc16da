//! Determines which actions are in force at a given minute of the week.
//!
//! The block/unblock stream and the filter-group stream are resolved independently.
//! Both look for the most recent occurrence at or before "now", wrapping across the
//! Saturday/Sunday boundary, and manual overrides are layered on top afterwards.

use crate::domain::models::{
    AccessAction, ActionKind, Override, ScheduleAction, TriggerDescriptor, TriggerKey,
    WeekInstant, MINUTES_PER_WEEK,
};
use serde::Serialize;

/// Access applied when no block/unblock entry precedes now.
pub const DEFAULT_ACCESS: AccessAction = AccessAction::Block;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub access: AccessAction,
    /// Trigger the access action came from; `None` for the fail-closed default,
    /// unenforced groups and overrides.
    pub access_trigger: Option<TriggerKey>,
    /// Filter groups to assign; `None` means no filter action this pass.
    pub filter_groups: Option<Vec<String>>,
    pub filter_trigger: Option<TriggerKey>,
    pub overridden: bool,
}

impl Resolution {
    /// Devices of groups that do not enforce a schedule are always unblocked.
    pub fn unenforced() -> Self {
        Self {
            access: AccessAction::Unblock,
            access_trigger: None,
            filter_groups: None,
            filter_trigger: None,
            overridden: false,
        }
    }
}

/// Concrete action carried out when a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Access(AccessAction),
    FilterGroups(Vec<String>),
}

enum Slot<'a> {
    Trigger(&'a TriggerDescriptor),
    Now,
}

/// Position of `instant` relative to `now`, shifted back one week when it lies after now.
fn relative_minute(instant: WeekInstant, now: WeekInstant) -> i64 {
    let position = i64::from(instant.minute_of_week());
    if position > i64::from(now.minute_of_week()) {
        position - i64::from(MINUTES_PER_WEEK)
    } else {
        position
    }
}

/// Resolves the schedule-derived actions in force at `now`.
pub fn resolve_current(now: WeekInstant, desired: &[TriggerDescriptor]) -> Resolution {
    let mut slots = desired
        .iter()
        .map(|descriptor| {
            (
                relative_minute(descriptor.instant(), now),
                0u8,
                descriptor.order,
                Slot::Trigger(descriptor),
            )
        })
        .collect::<Vec<_>>();
    // Entries at exactly now sort before the marker, so they count as already fired.
    slots.push((i64::from(now.minute_of_week()), 1, usize::MAX, Slot::Now));
    slots.sort_by_key(|(minute, rank, order, _)| (*minute, *rank, *order));

    let now_position = slots
        .iter()
        .position(|(_, _, _, slot)| matches!(slot, Slot::Now))
        .unwrap_or(slots.len());

    let mut access = None;
    let mut filter = None;
    for (_, _, _, slot) in slots[..now_position].iter().rev() {
        let Slot::Trigger(descriptor) = slot else {
            continue;
        };
        match descriptor.key.action.kind() {
            ActionKind::Block | ActionKind::Unblock if access.is_none() => {
                access = Some(*descriptor);
            }
            ActionKind::FilterSet if filter.is_none() => {
                filter = Some(*descriptor);
            }
            _ => {}
        }
        if access.is_some() && filter.is_some() {
            break;
        }
    }

    Resolution {
        access: access
            .and_then(|descriptor| descriptor.key.action.access())
            .unwrap_or(DEFAULT_ACCESS),
        access_trigger: access.map(|descriptor| descriptor.key.clone()),
        filter_groups: filter
            .and_then(|descriptor| descriptor.key.action.filter_groups())
            .map(<[String]>::to_vec),
        filter_trigger: filter.map(|descriptor| descriptor.key.clone()),
        overridden: false,
    }
}

/// Layers an override over a schedule-derived resolution.
///
/// A block/unblock override replaces the access action outright. Filter groups carried by
/// the override replace the schedule's filter assignment; without them the schedule's
/// assignment stands.
pub fn apply_override(resolution: Resolution, active: Option<&Override>) -> Resolution {
    let Some(active) = active else {
        return resolution;
    };

    let (filter_groups, filter_trigger) = match &active.filter_groups {
        Some(groups) => (Some(groups.clone()), None),
        None => (resolution.filter_groups, resolution.filter_trigger),
    };
    Resolution {
        access: active.action,
        access_trigger: None,
        filter_groups,
        filter_trigger,
        overridden: true,
    }
}

/// Action a firing trigger carries out once any override has been taken into account.
pub fn planned_action(action: &ScheduleAction, active: Option<&Override>) -> PlannedAction {
    match (action, active) {
        (ScheduleAction::FilterSet(groups), active) => PlannedAction::FilterGroups(
            active
                .and_then(|value| value.filter_groups.clone())
                .unwrap_or_else(|| groups.clone()),
        ),
        (_, Some(active)) => PlannedAction::Access(active.action),
        (ScheduleAction::Block, None) => PlannedAction::Access(AccessAction::Block),
        (ScheduleAction::Unblock, None) => PlannedAction::Access(AccessAction::Unblock),
    }
}

/// Most recent trigger of any kind at or before `now`.
pub fn last_trigger(now: WeekInstant, desired: &[TriggerDescriptor]) -> Option<&TriggerDescriptor> {
    desired
        .iter()
        .max_by_key(|descriptor| (relative_minute(descriptor.instant(), now), descriptor.order))
}

/// Next trigger strictly after `now`, wrapping into the following week.
pub fn next_trigger(now: WeekInstant, desired: &[TriggerDescriptor]) -> Option<&TriggerDescriptor> {
    desired.iter().min_by_key(|descriptor| {
        (
            relative_minute(descriptor.instant(), now) + i64::from(MINUTES_PER_WEEK),
            descriptor.order,
        )
    })
}
