/*!
 # Weekly alarm schedule

 Each weekday has a wake-up window given in minutes from local midnight.
 The [`ScheduleEvaluator`] looks at the window once per tick and only
 reaches into the engine when the alarm's desired state changes: it starts
 the sunrise when a window opens and cancels it when the window closes.
*/

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Timelike, Weekday};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::{Error, Result};

/// Days of the week in schedule order
pub const WEEK_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Minutes in a day; window bounds must stay within it
pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Default wake-up window, 07:00 to 08:00
pub const DEFAULT_WINDOW: (u32, u32) = (420, 480);

/// Full English name of a weekday, as used for schedule keys
pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// The wake-up window of one weekday
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    /// Weekday name, e.g. "Monday"
    pub day: String,
    /// Start of the window in minutes from midnight
    pub start: u32,
    /// End of the window in minutes from midnight, exclusive
    pub end: u32,
    /// Whether the alarm fires on this day
    pub enabled: bool,
}

impl DaySchedule {
    /// Creates a window for `day`
    pub fn new(day: Weekday, start: u32, end: u32, enabled: bool) -> Self {
        Self {
            day: weekday_name(day).to_string(),
            start,
            end,
            enabled,
        }
    }

    /// Whether the alarm should be on at `minute`
    pub fn contains(&self, minute: u32) -> bool {
        self.enabled && self.start <= minute && minute < self.end
    }

    /// Rejects unknown day names and bounds past midnight
    pub fn validate(&self) -> Result<()> {
        if !WEEK_DAYS.iter().any(|d| weekday_name(*d) == self.day) {
            return Err(Error::InvalidSchedule(format!("unknown day '{}'", self.day)));
        }
        for bound in [self.start, self.end] {
            if bound > MINUTES_PER_DAY {
                return Err(Error::ValueOutOfRange(bound, 0, MINUTES_PER_DAY));
            }
        }
        Ok(())
    }
}

/// Wake-up windows for the whole week, keyed by weekday name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeekSchedule {
    days: BTreeMap<String, DaySchedule>,
}

impl Default for WeekSchedule {
    fn default() -> Self {
        let (start, end) = DEFAULT_WINDOW;
        Self {
            days: WEEK_DAYS
                .iter()
                .map(|d| (weekday_name(*d).to_string(), DaySchedule::new(*d, start, end, true)))
                .collect(),
        }
    }
}

impl WeekSchedule {
    /// A schedule with no days at all; every day counts as disabled
    pub fn empty() -> Self {
        Self {
            days: BTreeMap::new(),
        }
    }

    /// Window for `day`, if one is set
    pub fn get(&self, day: Weekday) -> Option<&DaySchedule> {
        self.days.get(weekday_name(day))
    }

    /// Replaces the windows of the given days, keeping the others
    pub fn update(&mut self, days: impl IntoIterator<Item = DaySchedule>) -> Result<()> {
        let days: Vec<DaySchedule> = days.into_iter().collect();
        for day in &days {
            day.validate()?;
        }
        for day in days {
            debug!("Updating schedule for {}", day.day);
            self.days.insert(day.day.clone(), day);
        }
        Ok(())
    }

    /// Windows in week order, Monday first
    pub fn days(&self) -> Vec<DaySchedule> {
        WEEK_DAYS
            .iter()
            .filter_map(|d| self.get(*d).cloned())
            .collect()
    }
}

/// Schedule shared between the evaluator and the HTTP handlers
pub type SharedSchedule = Arc<RwLock<WeekSchedule>>;

/// JSON file the schedule is kept in
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    path: PathBuf,
}

impl ScheduleStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the schedule, falling back to defaults for missing days
    ///
    /// A missing file is not an error.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn load(&self) -> Result<WeekSchedule> {
        let mut schedule = WeekSchedule::default();
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No existing schedule file found, using default schedules");
                return Ok(schedule);
            }
            Err(e) => return Err(e.into()),
        };

        let stored: BTreeMap<String, DaySchedule> = serde_json::from_str(&contents)?;
        schedule.update(stored.into_values())?;
        debug!("Loaded schedule: {:?}", schedule);
        Ok(schedule)
    }

    /// Writes the schedule
    #[instrument(skip(self, schedule), fields(path = %self.path.display()))]
    pub fn save(&self, schedule: &WeekSchedule) -> Result<()> {
        let contents = serde_json::to_string_pretty(schedule)?;
        std::fs::write(&self.path, contents)?;
        debug!("Schedule saved");
        Ok(())
    }
}

/// What the evaluator concluded for one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Inside the window and not yet active
    Start,
    /// Inside the window and already active
    Continue,
    /// Outside the window but still marked active
    Stop,
    /// Outside the window and inactive
    Idle,
}

/// Decides what the alarm should do at `minute`
pub fn decide(day: Option<&DaySchedule>, minute: u32, active: bool) -> Decision {
    let in_window = day.is_some_and(|d| d.contains(minute));
    match (in_window, active) {
        (true, false) => Decision::Start,
        (true, true) => Decision::Continue,
        (false, true) => Decision::Stop,
        (false, false) => Decision::Idle,
    }
}

/// The engine entry points the evaluator drives
pub trait AlarmControl: Send + Sync {
    /// Starts the sunrise unless it is already running; false when busy
    fn start_alarm_if_needed(&self) -> bool;

    /// Cancels a running sunrise; false when none was running
    fn stop_alarm_if_active(&self) -> bool;
}

impl<T: AlarmControl + ?Sized> AlarmControl for Arc<T> {
    fn start_alarm_if_needed(&self) -> bool {
        (**self).start_alarm_if_needed()
    }

    fn stop_alarm_if_active(&self) -> bool {
        (**self).stop_alarm_if_active()
    }
}

/// Polls the schedule and starts or stops the alarm on window edges
pub struct ScheduleEvaluator<C> {
    control: C,
    schedule: SharedSchedule,
    active: bool,
}

impl<C: AlarmControl> ScheduleEvaluator<C> {
    /// Default period between ticks
    pub const DEFAULT_PERIOD: Duration = Duration::from_secs(5);

    /// Creates an evaluator that has not started any alarm yet
    pub fn new(control: C, schedule: SharedSchedule) -> Self {
        Self {
            control,
            schedule,
            active: false,
        }
    }

    /// Whether the evaluator believes its alarm is on
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Evaluates the schedule for a given weekday and minute of day
    pub fn tick_at(&mut self, weekday: Weekday, minute: u32) -> Decision {
        let decision = {
            let schedule = self.schedule.read();
            decide(schedule.get(weekday), minute, self.active)
        };

        match decision {
            Decision::Start => {
                if self.control.start_alarm_if_needed() {
                    info!("Alarm window open on {}, sunrise started", weekday_name(weekday));
                    self.active = true;
                } else {
                    debug!("Strip busy, retrying alarm start on next tick");
                }
            }
            Decision::Stop => {
                if self.control.stop_alarm_if_active() {
                    info!("Alarm window closed on {}, sunrise stopped", weekday_name(weekday));
                } else {
                    debug!("Alarm window closed, sunrise had already finished");
                }
                self.active = false;
            }
            Decision::Continue | Decision::Idle => {
                trace!("Schedule tick at minute {}: {:?}", minute, decision);
            }
        }
        decision
    }

    /// Evaluates the schedule against the local clock
    pub fn tick(&mut self) -> Decision {
        let now = chrono::Local::now();
        self.tick_at(now.weekday(), now.hour() * 60 + now.minute())
    }

    /// Ticks every `period` until `shutdown` fires
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, period: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Schedule evaluator started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }

        if self.active && !self.control.stop_alarm_if_active() {
            warn!("Evaluator stopped while its alarm was marked active");
        }
        info!("Schedule evaluator stopped");
    }
}
