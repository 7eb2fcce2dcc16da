use chrono::{Datelike, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Group name used for devices that carry no group on the controller.
pub const NO_GROUP: &str = "NOGROUP";

pub const DAYS_PER_WEEK: u8 = 7;
pub const MINUTES_PER_DAY: u32 = 24 * 60;
pub const MINUTES_PER_WEEK: u32 = DAYS_PER_WEEK as u32 * MINUTES_PER_DAY;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Block,
    Unblock,
    FilterSet,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Unblock => "unblock",
            Self::FilterSet => "filter-set",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessAction {
    Block,
    Unblock,
}

impl AccessAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Unblock => "unblock",
        }
    }

    pub fn is_blocked(self) -> bool {
        self == Self::Block
    }
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled action together with its parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", tag = "kind", content = "groups")]
pub enum ScheduleAction {
    Block,
    Unblock,
    FilterSet(Vec<String>),
}

impl ScheduleAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Block => ActionKind::Block,
            Self::Unblock => ActionKind::Unblock,
            Self::FilterSet(_) => ActionKind::FilterSet,
        }
    }

    pub fn access(&self) -> Option<AccessAction> {
        match self {
            Self::Block => Some(AccessAction::Block),
            Self::Unblock => Some(AccessAction::Unblock),
            Self::FilterSet(_) => None,
        }
    }

    pub fn filter_groups(&self) -> Option<&[String]> {
        match self {
            Self::FilterSet(groups) => Some(groups),
            _ => None,
        }
    }
}

impl fmt::Display for ScheduleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FilterSet(groups) => write!(f, "filter-set[{}]", groups.join(",")),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

/// One declared event in source form. The time is kept raw and parsed by the compiler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub time: String,
    pub action: ScheduleAction,
}

impl ScheduleEntry {
    pub fn new(time: impl Into<String>, action: ScheduleAction) -> Self {
        Self {
            time: time.into(),
            action,
        }
    }
}

/// Seven days, Sunday first, each an unordered list of entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeeklySchedule {
    days: [Vec<ScheduleEntry>; 7],
}

impl WeeklySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same entries on every day of the week.
    pub fn every_day(entries: &[ScheduleEntry]) -> Self {
        let mut schedule = Self::new();
        for day in 0..DAYS_PER_WEEK {
            schedule.set_day(day, entries.to_vec());
        }
        schedule
    }

    pub fn day(&self, day: u8) -> &[ScheduleEntry] {
        self.days
            .get(usize::from(day))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn set_day(&mut self, day: u8, entries: Vec<ScheduleEntry>) {
        if let Some(slot) = self.days.get_mut(usize::from(day)) {
            *slot = entries;
        }
    }

    pub fn push(&mut self, day: u8, entry: ScheduleEntry) {
        if let Some(slot) = self.days.get_mut(usize::from(day)) {
            slot.push(entry);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.days.iter().all(Vec::is_empty)
    }

    /// Entries in declaration order, Sunday first.
    pub fn entries(&self) -> impl Iterator<Item = (u8, &ScheduleEntry)> {
        self.days
            .iter()
            .enumerate()
            .flat_map(|(day, entries)| entries.iter().map(move |entry| (day as u8, entry)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagedGroup {
    pub name: String,
    pub enforce_schedule: bool,
    /// Reserved; carried from configuration, no behaviour attached.
    #[serde(default)]
    pub harsh: bool,
    #[serde(default)]
    pub schedule: WeeklySchedule,
}

impl ManagedGroup {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.name, "group.name")?;
        for (day, entry) in self.schedule.entries() {
            let field = format!("group.{}.schedule.{}", self.name, day_name(day));
            parse_hhmm(&entry.time).map_err(|_| format!("{field} time must be HH:MM"))?;
            if let ScheduleAction::FilterSet(groups) = &entry.action {
                if groups.is_empty() {
                    return Err(format!("{field} filter entry must name at least one group"));
                }
                for group in groups {
                    validate_non_empty(group, &format!("{field} filter group"))?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub mac: String,
    pub ip: Option<String>,
    pub group_id: String,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        mac: &str,
        ip: Option<String>,
        group_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            mac: normalize_mac(mac),
            ip: ip
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            group_id: group_id
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| NO_GROUP.to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "device.id")?;
        validate_mac(&self.mac, "device.mac")
    }
}

/// Composite identity of one installed trigger. Equality of the whole key is the only
/// criterion for "already installed".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TriggerKey {
    pub mac: String,
    pub minute: u8,
    pub hour: u8,
    pub day: u8,
    pub action: ScheduleAction,
}

impl TriggerKey {
    pub fn minute_of_week(&self) -> u32 {
        WeekInstant::new(self.day, self.hour, self.minute).minute_of_week()
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:02}:{:02} {}",
            self.mac,
            day_name(self.day),
            self.hour,
            self.minute,
            self.action
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerDescriptor {
    pub key: TriggerKey,
    /// Position in the source schedule; breaks ties within the same minute.
    pub order: usize,
}

impl TriggerDescriptor {
    pub fn sort_key(&self) -> (u8, u8, u8) {
        (self.key.day, self.key.hour, self.key.minute)
    }

    pub fn instant(&self) -> WeekInstant {
        WeekInstant::new(self.key.day, self.key.hour, self.key.minute)
    }
}

/// A minute within the 7-day cycle, Sunday = 0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeekInstant {
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
}

impl WeekInstant {
    pub fn new(day: u8, hour: u8, minute: u8) -> Self {
        Self { day, hour, minute }
    }

    pub fn from_datetime<T>(value: &T) -> Self
    where
        T: Datelike + Timelike,
    {
        Self {
            day: day_index(value.weekday()),
            hour: value.hour() as u8,
            minute: value.minute() as u8,
        }
    }

    pub fn minute_of_week(&self) -> u32 {
        u32::from(self.day) * MINUTES_PER_DAY + u32::from(self.hour) * 60 + u32::from(self.minute)
    }
}

impl fmt::Display for WeekInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:02}:{:02}", day_name(self.day), self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverrideExpiry {
    #[default]
    Permanent,
    UntilNextTrigger,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Override {
    pub action: AccessAction,
    #[serde(default)]
    pub expiry: OverrideExpiry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_groups: Option<Vec<String>>,
}

impl Override {
    pub fn consumed_by_next_trigger(&self) -> bool {
        self.expiry == OverrideExpiry::UntilNextTrigger
    }
}

/// Action accepted by the administrative override interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideCommand {
    Block,
    Unblock,
    UseSchedule,
}

impl OverrideCommand {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "unblock" => Ok(Self::Unblock),
            "use-schedule" | "use_schedule" | "schedule" => Ok(Self::UseSchedule),
            other => Err(format!("unsupported override action: {other}")),
        }
    }

    pub fn access(self) -> Option<AccessAction> {
        match self {
            Self::Block => Some(AccessAction::Block),
            Self::Unblock => Some(AccessAction::Unblock),
            Self::UseSchedule => None,
        }
    }
}

pub fn normalize_mac(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace('-', ":")
}

pub fn day_index(weekday: Weekday) -> u8 {
    weekday.num_days_from_sunday() as u8
}

pub fn day_name(day: u8) -> &'static str {
    match day {
        0 => "sunday",
        1 => "monday",
        2 => "tuesday",
        3 => "wednesday",
        4 => "thursday",
        5 => "friday",
        6 => "saturday",
        _ => "invalid",
    }
}

pub fn parse_day_name(value: &str) -> Option<u8> {
    match value.trim().to_ascii_lowercase().as_str() {
        "sunday" | "sun" => Some(0),
        "monday" | "mon" => Some(1),
        "tuesday" | "tue" => Some(2),
        "wednesday" | "wed" => Some(3),
        "thursday" | "thu" => Some(4),
        "friday" | "fri" => Some(5),
        "saturday" | "sat" => Some(6),
        _ => None,
    }
}

/// Parses a 24-hour `HH:MM` time into `(hour, minute)`.
pub fn parse_hhmm(value: &str) -> Result<(u8, u8), String> {
    let invalid = || format!("'{value}' must be HH:MM");
    let mut split = value.trim().split(':');
    let (Some(hour_str), Some(minute_str), None) = (split.next(), split.next(), split.next())
    else {
        return Err(invalid());
    };
    if hour_str.is_empty() || hour_str.len() > 2 || minute_str.len() != 2 {
        return Err(invalid());
    }

    let hour = hour_str.parse::<u8>().map_err(|_| invalid())?;
    let minute = minute_str.parse::<u8>().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

fn validate_mac(value: &str, field_name: &str) -> Result<(), String> {
    let octets = value.split(':').collect::<Vec<_>>();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(format!("{field_name} must be a colon-separated MAC address"));
    }
    Ok(())
}
