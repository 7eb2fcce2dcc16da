use crate::domain::models::{
    day_name, normalize_mac, parse_hhmm, ManagedGroup, TriggerDescriptor, TriggerKey,
};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("group {group}: {day} entry has malformed time '{time}' (expected HH:MM)")]
    MalformedTime {
        group: String,
        day: &'static str,
        time: String,
    },
}

/// Compiles a group's weekly schedule into the trigger set for one device.
///
/// The result is ordered by `(day, hour, minute)`; entries sharing a minute keep their
/// declaration order. A group that does not enforce its schedule compiles to nothing.
/// Entries that would produce an identical key are collapsed to the first declaration.
pub fn compile_schedule(
    group: &ManagedGroup,
    mac: &str,
) -> Result<Vec<TriggerDescriptor>, ScheduleError> {
    if !group.enforce_schedule {
        return Ok(Vec::new());
    }

    let mac = normalize_mac(mac);
    let mut seen = HashSet::new();
    let mut compiled = Vec::new();
    for (order, (day, entry)) in group.schedule.entries().enumerate() {
        let (hour, minute) =
            parse_hhmm(&entry.time).map_err(|_| ScheduleError::MalformedTime {
                group: group.name.clone(),
                day: day_name(day),
                time: entry.time.clone(),
            })?;
        let key = TriggerKey {
            mac: mac.clone(),
            minute,
            hour,
            day,
            action: entry.action.clone(),
        };
        if seen.insert(key.clone()) {
            compiled.push(TriggerDescriptor { key, order });
        }
    }

    compiled.sort_by_key(|descriptor| (descriptor.sort_key(), descriptor.order));
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ScheduleAction, ScheduleEntry, WeeklySchedule};

    const MAC: &str = "AA:BB:CC:00:11:22";

    fn group_with(schedule: WeeklySchedule) -> ManagedGroup {
        ManagedGroup {
            name: "kids".to_string(),
            enforce_schedule: true,
            harsh: false,
            schedule,
        }
    }

    #[test]
    fn unenforced_group_compiles_to_nothing() {
        let mut group = group_with(WeeklySchedule::every_day(&[ScheduleEntry::new(
            "00:00",
            ScheduleAction::Block,
        )]));
        group.enforce_schedule = false;
        assert!(compile_schedule(&group, MAC).expect("compile").is_empty());
    }

    #[test]
    fn entries_are_time_ordered_within_each_day() {
        let mut schedule = WeeklySchedule::new();
        schedule.set_day(
            2,
            vec![
                ScheduleEntry::new("22:30", ScheduleAction::Block),
                ScheduleEntry::new("07:30", ScheduleAction::Unblock),
                ScheduleEntry::new("00:00", ScheduleAction::Block),
            ],
        );
        schedule.set_day(0, vec![ScheduleEntry::new("09:00", ScheduleAction::Unblock)]);

        let compiled = compile_schedule(&group_with(schedule), MAC).expect("compile");
        let keys = compiled
            .iter()
            .map(|descriptor| descriptor.sort_key())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec![(0, 9, 0), (2, 0, 0), (2, 7, 30), (2, 22, 30)]);
        assert!(compiled.iter().all(|descriptor| descriptor.key.mac == "aa:bb:cc:00:11:22"));
    }

    #[test]
    fn same_minute_entries_keep_declaration_order() {
        let mut schedule = WeeklySchedule::new();
        schedule.set_day(
            4,
            vec![
                ScheduleEntry::new("16:00", ScheduleAction::Unblock),
                ScheduleEntry::new(
                    "16:00",
                    ScheduleAction::FilterSet(vec!["b".to_string(), "a".to_string()]),
                ),
            ],
        );
        let compiled = compile_schedule(&group_with(schedule), MAC).expect("compile");
        assert_eq!(compiled[0].key.action, ScheduleAction::Unblock);
        assert_eq!(
            compiled[1].key.action.filter_groups(),
            Some(&["b".to_string(), "a".to_string()][..])
        );
    }

    #[test]
    fn duplicate_entries_collapse_to_one_key() {
        let mut schedule = WeeklySchedule::new();
        schedule.set_day(
            1,
            vec![
                ScheduleEntry::new("08:00", ScheduleAction::Block),
                ScheduleEntry::new("8:00", ScheduleAction::Block),
            ],
        );
        let compiled = compile_schedule(&group_with(schedule), MAC).expect("compile");
        assert_eq!(compiled.len(), 1);
    }

    #[test]
    fn malformed_time_is_a_configuration_error() {
        let mut schedule = WeeklySchedule::new();
        schedule.set_day(5, vec![ScheduleEntry::new("7.30", ScheduleAction::Unblock)]);
        let error = compile_schedule(&group_with(schedule), MAC).expect_err("must fail");
        assert_eq!(
            error,
            ScheduleError::MalformedTime {
                group: "kids".to_string(),
                day: "friday",
                time: "7.30".to_string(),
            }
        );
    }
}
