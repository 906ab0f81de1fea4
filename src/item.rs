use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WreckitError};

// --- Enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    #[default]
    Idea,
    Researching,
    Researched,
    Planning,
    Planned,
    Implementing,
    Critique,
    InPr,
    Merged,
    Done,
    Abandoned,
}

impl ItemState {
    /// Validates whether a transition from this state to `to` is allowed.
    ///
    /// Rules:
    /// - Forward progression: idea -> researching -> researched -> planning
    ///   -> planned -> implementing -> critique -> in_pr -> merged -> done
    /// - Failure rollbacks: researching -> idea, planning -> researched
    /// - Any non-terminal state can transition to Abandoned
    /// - Done and Abandoned are terminal
    pub fn is_valid_transition(&self, to: &ItemState) -> bool {
        use ItemState::*;

        if *to == Abandoned && !self.is_terminal() {
            return true;
        }

        matches!(
            (self, to),
            (Idea, Researching)
                | (Researching, Researched)
                | (Researching, Idea)
                | (Researched, Planning)
                | (Planning, Planned)
                | (Planning, Researched)
                | (Planned, Implementing)
                | (Implementing, Critique)
                | (Critique, InPr)
                | (InPr, Merged)
                | (Merged, Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Done | ItemState::Abandoned)
    }

    /// True once the item has (or should have) a work branch.
    pub fn has_branch(&self) -> bool {
        matches!(
            self,
            ItemState::Implementing
                | ItemState::Critique
                | ItemState::InPr
                | ItemState::Merged
                | ItemState::Done
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Idea => "idea",
            ItemState::Researching => "researching",
            ItemState::Researched => "researched",
            ItemState::Planning => "planning",
            ItemState::Planned => "planned",
            ItemState::Implementing => "implementing",
            ItemState::Critique => "critique",
            ItemState::InPr => "in_pr",
            ItemState::Merged => "merged",
            ItemState::Done => "done",
            ItemState::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_item_state(s: &str) -> std::result::Result<ItemState, String> {
    match s.to_lowercase().as_str() {
        "idea" => Ok(ItemState::Idea),
        "researching" => Ok(ItemState::Researching),
        "researched" => Ok(ItemState::Researched),
        "planning" => Ok(ItemState::Planning),
        "planned" => Ok(ItemState::Planned),
        "implementing" => Ok(ItemState::Implementing),
        "critique" => Ok(ItemState::Critique),
        "in_pr" => Ok(ItemState::InPr),
        "merged" => Ok(ItemState::Merged),
        "done" => Ok(ItemState::Done),
        "abandoned" => Ok(ItemState::Abandoned),
        _ => Err(format!("Invalid state '{}'", s)),
    }
}

/// The fixed phase sequence an item moves through.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Plan,
    Implement,
    Pr,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Plan => "plan",
            Phase::Implement => "implement",
            Phase::Pr => "pr",
        }
    }

    pub const ALL: [Phase; 4] = [Phase::Research, Phase::Plan, Phase::Implement, Phase::Pr];

    /// The state an item must be in for this phase to begin.
    ///
    /// The in-flight state of the same phase is also accepted so a crashed
    /// or failed run can be retried without doctor intervention.
    pub fn accepts_state(&self, state: ItemState) -> bool {
        match self {
            Phase::Research => matches!(state, ItemState::Idea | ItemState::Researching),
            Phase::Plan => matches!(state, ItemState::Researched | ItemState::Planning),
            Phase::Implement => matches!(state, ItemState::Planned | ItemState::Implementing),
            Phase::Pr => matches!(state, ItemState::Critique),
        }
    }

    /// The in-flight state while this phase runs.
    pub fn active_state(&self) -> ItemState {
        match self {
            Phase::Research => ItemState::Researching,
            Phase::Plan => ItemState::Planning,
            Phase::Implement => ItemState::Implementing,
            Phase::Pr => ItemState::Critique,
        }
    }

    /// The state an item lands in when this phase succeeds.
    pub fn success_state(&self) -> ItemState {
        match self {
            Phase::Research => ItemState::Researched,
            Phase::Plan => ItemState::Planned,
            Phase::Implement => ItemState::Critique,
            Phase::Pr => ItemState::InPr,
        }
    }

    /// The state an item falls back to when this phase is cancelled.
    ///
    /// Implement has no earlier state to return to once entered: the same
    /// story is retried on the next run.
    pub fn failure_state(&self) -> ItemState {
        match self {
            Phase::Research => ItemState::Idea,
            Phase::Plan => ItemState::Researched,
            Phase::Implement => ItemState::Implementing,
            Phase::Pr => ItemState::Critique,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_phase(s: &str) -> std::result::Result<Phase, String> {
    match s.to_lowercase().as_str() {
        "research" => Ok(Phase::Research),
        "plan" => Ok(Phase::Plan),
        "implement" => Ok(Phase::Implement),
        "pr" | "pull-request" => Ok(Phase::Pr),
        _ => Err(format!(
            "Invalid phase '{}': expected research, plan, implement, or pr",
            s
        )),
    }
}

/// The next phase suggested by an item's current state, or `None` when the
/// item is waiting on an external event or is terminal.
pub fn next_phase_for(state: ItemState) -> Option<Phase> {
    match state {
        ItemState::Idea | ItemState::Researching => Some(Phase::Research),
        ItemState::Researched | ItemState::Planning => Some(Phase::Plan),
        ItemState::Planned | ItemState::Implementing => Some(Phase::Implement),
        ItemState::Critique => Some(Phase::Pr),
        ItemState::InPr | ItemState::Merged | ItemState::Done | ItemState::Abandoned => None,
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    #[default]
    Pending,
    InProgress,
    Done,
}

// --- Structs ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Item {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub overview: String,
    pub section: String,
    #[serde(default)]
    pub state: ItemState,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_story_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<String>,
}

impl Item {
    pub fn new(id: &str, title: &str, overview: &str, section: &str) -> Self {
        let now = Utc::now();
        Item {
            id: id.to_string(),
            title: title.to_string(),
            overview: overview.to_string(),
            section: section.to_string(),
            state: ItemState::Idea,
            created_at: now,
            updated_at: now,
            current_story_id: None,
            pr_number: None,
            branch_name: None,
            priority: None,
            urgency: None,
            signals: Vec::new(),
        }
    }

    /// Transition to a new state, validating against the state machine.
    pub fn transition(&mut self, to: ItemState) -> Result<()> {
        if !self.state.is_valid_transition(&to) {
            return Err(WreckitError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Ordinal portion of the item id (the NNN in `section/NNN-slug`).
    pub fn ordinal(&self) -> u32 {
        id_ordinal(&self.id).unwrap_or(0)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub status: StoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Prd {
    #[serde(default)]
    pub stories: Vec<Story>,
}

impl Prd {
    /// First story in document order that is still pending.
    ///
    /// Document order is the priority order: PRD authors put the most
    /// important story first.
    pub fn next_pending(&self) -> Option<&Story> {
        self.stories
            .iter()
            .find(|s| s.status == StoryStatus::Pending)
    }

    pub fn find(&self, story_id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == story_id)
    }

    pub fn set_status(&mut self, story_id: &str, status: StoryStatus) -> Result<()> {
        let story = self
            .stories
            .iter_mut()
            .find(|s| s.id == story_id)
            .ok_or_else(|| {
                WreckitError::InvalidState(format!("Story {} not found in PRD", story_id))
            })?;
        story.status = status;
        Ok(())
    }

    pub fn in_progress_count(&self) -> usize {
        self.stories
            .iter()
            .filter(|s| s.status == StoryStatus::InProgress)
            .count()
    }

    pub fn all_done(&self) -> bool {
        !self.stories.is_empty() && self.stories.iter().all(|s| s.status == StoryStatus::Done)
    }
}

// --- Id helpers ---

/// Derive a slug from a title: lowercase, non-alphanumerics become `-`,
/// runs collapsed, leading/trailing dashes trimmed.
pub fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<&str>>()
        .join("-")
}

/// Section portion of an id of the form `section/NNN-slug`.
pub fn id_section(id: &str) -> Option<&str> {
    id.split_once('/').map(|(section, _)| section)
}

/// Ordinal portion of an id of the form `section/NNN-slug`.
pub fn id_ordinal(id: &str) -> Option<u32> {
    let (_, rest) = id.split_once('/')?;
    let digits: &str = rest.split('-').next()?;
    digits.parse().ok()
}

/// Validate an item id shape without touching disk.
pub fn is_valid_id(id: &str) -> bool {
    match id.split_once('/') {
        Some((section, rest)) => {
            !section.is_empty()
                && section.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                && id_ordinal(id).is_some()
                && rest.contains('-')
        }
        None => false,
    }
}

// --- Timestamp (de)serialization ---

/// RFC 3339 strings are canonical. Integer epoch seconds or milliseconds
/// are accepted on read (legacy records persisted both) and canonicalized
/// on the next save. Values >= 10^12 are treated as milliseconds.
pub mod timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Epoch(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(serde::de::Error::custom),
            Raw::Epoch(n) => {
                let ts = if n >= MILLIS_THRESHOLD {
                    Utc.timestamp_millis_opt(n).single()
                } else {
                    Utc.timestamp_opt(n, 0).single()
                };
                ts.ok_or_else(|| {
                    serde::de::Error::custom(format!("timestamp out of range: {}", n))
                })
            }
        }
    }
}
